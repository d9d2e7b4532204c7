//! Publishing the installation image to the datastore.
//!
//! With `access: scp` the image is copied from the FTP host by an `scp`
//! run on the ESX host; with `access: nfs` the source folder is itself a
//! datastore and the target becomes a symlink into it.

use super::{LabError, Topology};
use crate::config::schema::datastore_fs_path;
use crate::vm::prompts::{HOST_PASSWORD, PROMPTS};
use log::{error, info};
use std::time::{Duration, Instant};

/// How long `echo $?` may take to print the exit status
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

/// Name of the newest ISO in an `ls -lt` listing
pub fn newest_iso(listing: &str) -> Option<String> {
    PROMPTS
        .iso_listing
        .captures(listing)
        .map(|c| format!("{}.iso", &c[2]))
}

fn volume_path(path: &str) -> Result<String, LabError> {
    datastore_fs_path(path).ok_or_else(|| LabError::NotADatastorePath(path.to_string()))
}

impl Topology {
    /// Newest ISO in the FTP source folder
    pub fn latest_iso_on_ftp(&self) -> Result<String, LabError> {
        let mut conn = self.ftp_session()?;
        info!("Checking builds...");
        conn.send_line(&format!("ls -lt '{}' --color=never", self.ftp.source_folder))?;
        let m = conn.expect(&PROMPTS.host, self.timeouts.login)?;
        conn.close()?;

        let listing = format!("{}{}", m.before, m.after);
        match newest_iso(&listing) {
            Some(iso) => {
                info!("ISO {} found.", iso);
                Ok(iso)
            }
            None => {
                error!("Couldn't get a build name; ls output:{}", listing);
                Err(LabError::IsoNotFound(listing))
            }
        }
    }

    /// Copy `iso` (or the newest build) from the FTP host to `ftp.target`
    pub fn copy_build_via_scp(&self, iso: Option<&str>) -> Result<(), LabError> {
        let build = match iso {
            Some(iso) => iso.to_string(),
            None => self.latest_iso_on_ftp()?,
        };
        let local_iso = volume_path(&self.ftp.target)?;
        let remote_iso = format!("{}{}", self.ftp.source_folder, build);
        let scp = format!(
            "scp -q -oStrictHostKeyChecking=no -oUserKnownHostsFile=/dev/null {}@{}:'{}' '{}'",
            self.ftp.user, self.ftp.ip, remote_iso, local_iso
        );
        info!("Copying build \"{}\"...", build);

        let timeout = self.timeouts.build;
        let mut conn = self.esx_session()?;
        let mut start = Instant::now();

        // Drop the previous image or symlink
        conn.send_line(&format!("rm {}", local_iso))?;
        conn.expect(&PROMPTS.host_or_password, timeout)?;

        conn.send_line(&scp)?;
        if conn.expect(&PROMPTS.host_or_password, timeout)?.index == HOST_PASSWORD {
            start = Instant::now();
            conn.send_line(&self.ftp.password)?;
            conn.expect(&PROMPTS.host_or_password, timeout)?;
        }
        let elapsed = start.elapsed();

        conn.send_line("echo $?")?;
        let copied = conn.expect(&PROMPTS.exit_ok, EXIT_STATUS_WAIT);
        conn.close()?;
        if copied.is_err() {
            return Err(LabError::CopyFailed(build));
        }
        info!(
            "The build '{}' copied from {} (elapsed time: {:?})",
            build, self.ftp.ip, elapsed
        );
        Ok(())
    }

    /// Point `ftp.target` at `iso` (or the newest build) in the NFS source folder
    pub fn create_symlink_to_iso(&self, iso: Option<&str>) -> Result<(), LabError> {
        let source_folder = volume_path(&self.ftp.source_folder)?;
        let target = volume_path(&self.ftp.target)?;
        let timeout = self.timeouts.build;

        let mut conn = self.esx_session()?;
        let build = match iso {
            Some(iso) => iso.to_string(),
            None => {
                conn.send_line(&format!("ls -lt '{}' --color=never", source_folder))?;
                let m = conn.expect(&PROMPTS.host, self.timeouts.login)?;
                let listing = format!("{}{}", m.before, m.after);
                let iso = newest_iso(&listing).ok_or(LabError::IsoNotFound(listing))?;
                info!("Iso {} found.", iso);
                iso
            }
        };

        conn.send_line(&format!("rm {}", target))?;
        conn.expect(&PROMPTS.host, timeout)?;
        conn.send_line(&format!("ln -s '{}{}' '{}'", source_folder, build, target))?;
        conn.expect(&PROMPTS.host, timeout)?;

        conn.send_line("echo $?")?;
        let linked = conn.expect(&PROMPTS.exit_ok, EXIT_STATUS_WAIT);
        conn.close()?;
        if linked.is_err() {
            return Err(LabError::SymlinkFailed(target));
        }
        info!("Symlink to iso {} was created.", build);
        Ok(())
    }
}
