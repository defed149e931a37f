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


//! Activation bytes and DRM removal
//!
//! - **activation**: activation bytes type, strict validation and retrieval
//! - **mp4**: box reader for the container
//! - **aax**: key derivation, in-place sample decryption and remux to M4B

pub mod activation;
pub mod mp4;
pub mod aax;

pub use activation::{
    ActivationBytes,
    ActivationService,
    parse_activation_bytes,
    validate_activation_bytes,
};

pub use aax::{
    AaxDecrypter,
    AaxMetadata,
    DecryptOutcome,
    is_aax_file,
    verify_activation_bytes,
};
