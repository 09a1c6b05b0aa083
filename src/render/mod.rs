//! Batched rendering of the display window

pub mod batcher;

pub use batcher::{LogRenderer, RenderBatcher, RenderWindow, Renderer};
