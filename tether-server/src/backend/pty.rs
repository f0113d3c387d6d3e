//! PTY handle wrapper for portable-pty

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use tether_utils::{Result, TetherError};

/// Handle to a running PTY
///
/// Cheap to clone; all parts are shared. The child is the local bridge
/// process (a multiplexer client, or the raw shell itself); killing it
/// never touches a multiplexer session.
#[derive(Clone)]
pub struct PtyHandle {
    /// The master side of the PTY
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    /// The child process
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    /// Reader for PTY output
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    /// Writer for PTY input
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PtyHandle {
    /// Open a PTY with the given geometry and spawn `cmd` on its slave side
    pub fn spawn(cmd: CommandBuilder, cols: u16, rows: u16) -> Result<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TetherError::pty(format!("Failed to open PTY: {}", e)))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TetherError::ProcessSpawn(format!("Failed to spawn: {}", e)))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TetherError::pty(format!("Failed to clone reader: {}", e)))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TetherError::pty(format!("Failed to get writer: {}", e)))?;

        Ok(Self {
            master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    /// Write all data to the PTY (sends to the child process)
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .write_all(data)
            .map_err(|e| TetherError::pty(format!("Write failed: {}", e)))
    }

    /// Resize the PTY
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock();
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TetherError::pty(format!("Resize failed: {}", e)))
    }

    /// Check if the child process has exited
    pub fn try_wait(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock();
        match child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.exit_code() as i32)),
            Ok(None) => Ok(None),
            Err(e) => Err(TetherError::pty(format!("Wait failed: {}", e))),
        }
    }

    /// Kill the child process (the bridge, not the multiplexer session)
    pub fn kill(&self) -> Result<()> {
        let mut child = self.child.lock();
        child
            .kill()
            .map_err(|e| TetherError::pty(format!("Kill failed: {}", e)))
    }

    /// Get a clone of the reader (for the output pump)
    pub fn clone_reader(&self) -> Arc<Mutex<Box<dyn Read + Send>>> {
        self.reader.clone()
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_read() {
        let mut cmd = CommandBuilder::new("echo");
        cmd.arg("hello");

        let handle = PtyHandle::spawn(cmd, 80, 24).unwrap();

        // Give the process a moment to produce output
        std::thread::sleep(std::time::Duration::from_millis(200));

        let reader = handle.clone_reader();
        let mut buf = [0u8; 1024];
        let n = reader.lock().read(&mut buf).unwrap();
        assert!(n > 0);
        assert!(String::from_utf8_lossy(&buf[..n]).contains("hello"));
    }

    #[test]
    fn test_write_and_echo_back() {
        let cmd = CommandBuilder::new("cat");
        let handle = PtyHandle::spawn(cmd, 80, 24).unwrap();

        handle.write_all(b"ping\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        let reader = handle.clone_reader();
        let mut buf = [0u8; 1024];
        let n = reader.lock().read(&mut buf).unwrap();
        assert!(n > 0);

        handle.kill().unwrap();
    }

    #[test]
    fn test_resize() {
        let cmd = CommandBuilder::new("cat");
        let handle = PtyHandle::spawn(cmd, 80, 24).unwrap();
        assert!(handle.resize(120, 40).is_ok());
        assert!(handle.resize(119, 40).is_ok());
        handle.kill().unwrap();
    }

    #[test]
    fn test_try_wait_reports_exit() {
        let mut cmd = CommandBuilder::new("sh");
        cmd.args(["-c", "exit 0"]);
        let handle = PtyHandle::spawn(cmd, 80, 24).unwrap();

        // Poll until the child exits
        for _ in 0..50 {
            if handle.try_wait().unwrap().is_some() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("child never exited");
    }
}
