//! Virtual display supervision.
//!
//! Each session runs its browser inside its own X virtual framebuffer so
//! concurrent recordings never capture each other. Display numbers are a
//! finite OS-level resource; the allocator hands them out and takes them
//! back when a session reaches a terminal state.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

/// Raised when every display number is in use. This is the one fault that is
/// fatal to the whole process rather than to a single session.
#[derive(Debug, Error, PartialEq)]
#[error("no free display numbers available")]
pub struct DisplaysExhausted;

/// Process-wide pool of X display numbers.
pub struct DisplayAllocator {
    free: Mutex<BTreeSet<u32>>,
}

impl DisplayAllocator {
    pub fn new(base: u32, capacity: u32) -> Self {
        Self {
            free: Mutex::new((base..base + capacity).collect()),
        }
    }

    pub fn acquire(&self) -> Result<u32, DisplaysExhausted> {
        let mut free = self.free.lock().unwrap();
        let number = free.iter().next().copied().ok_or(DisplaysExhausted)?;
        free.remove(&number);
        Ok(number)
    }

    pub fn release(&self, number: u32) {
        let mut free = self.free.lock().unwrap();
        free.insert(number);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// A running virtual display bound to one session.
pub struct DisplayHandle {
    number: u32,
    child: Option<Child>,
    allocator: Arc<DisplayAllocator>,
    released: bool,
}

impl DisplayHandle {
    /// The display id in the form the browser and encoder expect, `":107"`.
    pub fn display_id(&self) -> String {
        format!(":{}", self.number)
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_healthy(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the display server and return its number to the pool. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if child.start_kill().is_ok() {
                let _ = child.wait().await;
            }
        }
        if !self.released {
            self.released = true;
            self.allocator.release(self.number);
        }
    }
}

impl Drop for DisplayHandle {
    fn drop(&mut self) {
        // kill_on_drop reaps the process; the number still has to go back.
        if !self.released {
            self.released = true;
            self.allocator.release(self.number);
        }
    }
}

/// Wraps the lifecycle of X virtual framebuffer processes.
pub struct DisplaySupervisor {
    allocator: Arc<DisplayAllocator>,
}

impl DisplaySupervisor {
    pub fn new(allocator: Arc<DisplayAllocator>) -> Self {
        Self { allocator }
    }

    /// Start a virtual display at the given geometry.
    pub async fn start(&self, width: u32, height: u32) -> Result<DisplayHandle> {
        let number = self.allocator.acquire().map_err(anyhow::Error::from)?;

        let child = Command::new("Xvfb")
            .arg(format!(":{number}"))
            .args(["-screen", "0"])
            .arg(format!("{width}x{height}x24"))
            .args(["-nolisten", "tcp"])
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                self.allocator.release(number);
                return Err(e).context("failed to spawn Xvfb");
            }
        };

        let mut handle = DisplayHandle {
            number,
            child: Some(child),
            allocator: self.allocator.clone(),
            released: false,
        };

        if let Err(e) = wait_for_socket(&mut handle).await {
            handle.stop().await;
            return Err(e);
        }

        Ok(handle)
    }
}

/// X creates a unix socket per display once it accepts clients.
async fn wait_for_socket(handle: &mut DisplayHandle) -> Result<()> {
    let socket = PathBuf::from(format!("/tmp/.X11-unix/X{}", handle.number));

    for _ in 0..50 {
        if !handle.is_healthy() {
            bail!("display server {} exited during startup", handle.display_id());
        }
        if socket.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    bail!(
        "display server {} did not come up within 5s",
        handle.display_id()
    )
}
