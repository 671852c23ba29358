//! Named-pipe (FIFO) sink: non-blocking writes so a FIFO with no reader
//! attached never stalls the decode path (§4.5 "non-blocking FIFO writes").

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use crate::error::{GatewayError, GatewayResult};

const O_NONBLOCK: i32 = 0o4000;

pub struct FifoSink {
    path: String,
    file: std::sync::Mutex<File>,
}

impl FifoSink {
    pub fn open(path: &str) -> GatewayResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(O_NONBLOCK)
            .open(path)
            .map_err(|e| GatewayError::Sink {
                sink: "fifo",
                message: format!("opening {path}: {e}"),
            })?;
        Ok(Self {
            path: path.to_string(),
            file: std::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// A `WouldBlock` error (no reader on the other end) is treated as a
    /// normal dropped frame, not a sink failure.
    pub fn write_pcm(&self, pcm: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap();
        match file.write_all(pcm) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}
