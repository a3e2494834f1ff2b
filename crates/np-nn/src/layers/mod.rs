// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

pub mod activation;
pub mod linear;
pub mod normalization;
pub mod sequential;

pub use activation::Relu;
