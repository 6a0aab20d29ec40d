//! Magick Stream - an async duplex byte stream over ImageMagick's `convert`.
//!
//! Write an image into an [`ImageStream`](stream::ImageStream), read the
//! transformed image out of it. The process is spawned lazily and its
//! diagnostics are turned into stream errors.

pub mod args;
pub mod config;
pub mod files;
pub mod process;
pub mod stream;
