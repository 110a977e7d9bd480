// src/capture/mod.rs
//
// Frame acquisition. The reader task owns the source and publishes the
// freshest frame through a watch slot; nothing downstream ever waits on it.

mod ffmpeg;
mod reader;
#[cfg(test)]
pub mod scripted;
mod watchdog;

use anyhow::Result;
use image::RgbImage;
use std::future::Future;

pub use ffmpeg::FfmpegSource;
pub use reader::{FrameHandle, Liveness, ReaderStatus, StreamReader};
pub use watchdog::{Backoff, FreezeWatchdog};

pub trait FrameSource: Send + 'static {
    /// Connect (or reconnect) to the stream.
    fn open(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Next decoded frame. `Ok(None)` means the stream ended.
    fn read(&mut self) -> impl Future<Output = Result<Option<RgbImage>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
