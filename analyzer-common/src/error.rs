// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0

/// Boxed error, e.g. to be used as error source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
