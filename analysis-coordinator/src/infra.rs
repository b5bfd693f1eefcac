// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod metadata;

#[cfg(any(feature = "cloud", feature = "standalone"))]
pub mod storage;
