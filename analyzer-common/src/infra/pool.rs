// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[cfg(feature = "cloud")]
pub mod postgres;

#[cfg(feature = "standalone")]
pub mod sqlite;

/// Database selected at build time: PostgreSQL for `cloud`, SQLite for `standalone`.
#[cfg(feature = "cloud")]
pub type Db = sqlx::Postgres;

#[cfg(all(feature = "standalone", not(feature = "cloud")))]
pub type Db = sqlx::Sqlite;

#[cfg(feature = "cloud")]
pub type Pool = postgres::PostgresPool;

#[cfg(all(feature = "standalone", not(feature = "cloud")))]
pub type Pool = sqlite::SqlitePool;

#[cfg(feature = "cloud")]
pub type Config = postgres::Config;

#[cfg(all(feature = "standalone", not(feature = "cloud")))]
pub type Config = sqlite::Config;
