//! OS adapter backed by external processes.
//!
//! `unzip` unpacks staged archives, `sh` runs installer scripts, `reboot`
//! restarts the terminal. With `live == false` (host simulation) the
//! reboot and clock changes are logged instead of performed, and the
//! clock set by `0x03` is kept as an offset over the system clock.

use std::process::Command;

use log::{info, warn};

use super::fs_storage::FsStorage;
use super::time::wall_clock_ms;
use crate::app::ports::{OsError, OsPort};

pub struct ProcessOs {
    paths: FsStorage,
    live: bool,
    offset_ms: i64,
}

impl ProcessOs {
    /// Paths are resolved the same way as `paths` resolves storage paths.
    pub fn new(paths: FsStorage, live: bool) -> Self {
        Self {
            paths,
            live,
            offset_ms: 0,
        }
    }

    fn run(cmd: &mut Command) -> Result<(), OsError> {
        let label = format!("{:?}", cmd);
        let status = cmd.status().map_err(|e| {
            warn!("OS: cannot spawn {}: {}", label, e);
            OsError::IoError
        })?;
        if status.success() {
            Ok(())
        } else {
            warn!("OS: {} exited with {}", label, status);
            Err(OsError::CommandFailed(label))
        }
    }
}

impl OsPort for ProcessOs {
    fn unpack(&mut self, archive: &str, dest_dir: &str) -> Result<(), OsError> {
        let archive = self.paths.resolve(archive);
        let dest = self.paths.resolve(dest_dir);
        std::fs::create_dir_all(&dest).map_err(|e| {
            warn!("OS: cannot create {}: {}", dest.display(), e);
            OsError::IoError
        })?;
        info!("OS: unpacking {} into {}", archive.display(), dest.display());
        Self::run(Command::new("unzip").arg("-o").arg("-q").arg(&archive).arg("-d").arg(&dest))
    }

    fn run_installer(&mut self, script_path: &str, script: &str) -> Result<(), OsError> {
        let path = self.paths.resolve(script_path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|_| OsError::IoError)?;
        }
        std::fs::write(&path, script).map_err(|e| {
            warn!("OS: cannot write {}: {}", path.display(), e);
            OsError::IoError
        })?;
        info!("OS: running installer {}", path.display());
        Self::run(Command::new("sh").arg(&path))
    }

    fn reboot(&mut self, delay_secs: u32) {
        if !self.live {
            info!("OS: reboot in {} s (simulated)", delay_secs);
            return;
        }
        info!("OS: rebooting in {} s", delay_secs);
        let script = format!("sleep {} && reboot", delay_secs);
        if let Err(e) = Command::new("sh").arg("-c").arg(script).spawn() {
            warn!("OS: cannot schedule reboot: {}", e);
        }
    }

    fn set_time(&mut self, epoch_secs: u64) -> Result<(), OsError> {
        let target_ms = epoch_secs.saturating_mul(1000);
        if self.live {
            Self::run(Command::new("date").arg("-s").arg(format!("@{}", epoch_secs)))?;
            self.offset_ms = 0;
        } else {
            self.offset_ms = target_ms as i64 - wall_clock_ms() as i64;
        }
        info!("OS: clock set to {}", epoch_secs);
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        (wall_clock_ms() as i64 + self.offset_ms).max(0) as u64
    }
}
