// RN Audible - React Native Audible Client
// Copyright (C) 2025 Henning Berge
//
// This program is a Rust port of Libation (https://github.com/rmcrackan/Libation)
// Original work Copyright (C) Libation contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Audible and Amazon endpoints
//!
//! Locale table, device identity, the OAuth session, and the bearer client
//! used for library and content calls.

pub mod locale;
pub mod device;
pub mod auth;
pub mod client;
pub mod library;
pub mod content;

// Re-export commonly used types
pub use auth::{Account, AuthChallenge, AuthSession, AuthState, TokenGrant, TokenSet};
pub use client::AudibleClient;
pub use device::{DeviceIdentity, DeviceSerial};
pub use library::{LibraryItem, LibraryOptions};
pub use locale::{Locale, LocaleRegistry};
