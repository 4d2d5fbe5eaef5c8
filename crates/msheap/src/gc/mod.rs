//! The mark-sweep collector: bitmaps, marking, the collection cycle, and
//! the background daemon.

pub mod bitmap;
pub(crate) mod collector;
pub(crate) mod daemon;
pub mod marker;
pub mod request;
