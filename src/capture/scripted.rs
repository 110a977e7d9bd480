// src/capture/scripted.rs
//
// In-memory frame source for tests: each `open` starts the next scripted
// session; each session yields its steps in order.

use super::FrameSource;
use anyhow::{bail, Result};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Step {
    Frame(RgbImage),
    Error,
    /// Never returns; exercises the read timeout
    Stall,
}

pub struct ScriptedSource {
    sessions: VecDeque<Vec<Step>>,
    current: VecDeque<Step>,
    frame_interval: Duration,
    pub opens: Arc<AtomicU32>,
}

impl ScriptedSource {
    pub fn new(sessions: Vec<Vec<Step>>, frame_interval: Duration) -> Self {
        Self {
            sessions: sessions.into(),
            current: VecDeque::new(),
            frame_interval,
            opens: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl FrameSource for ScriptedSource {
    async fn open(&mut self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.sessions.pop_front() {
            Some(steps) => {
                self.current = steps.into();
                Ok(())
            }
            None => bail!("camera unreachable"),
        }
    }

    async fn read(&mut self) -> Result<Option<RgbImage>> {
        match self.current.pop_front() {
            Some(Step::Frame(img)) => {
                tokio::time::sleep(self.frame_interval).await;
                Ok(Some(img))
            }
            Some(Step::Error) => bail!("decode error"),
            Some(Step::Stall) => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.current.clear();
    }
}
