use crate::Result;

/// Set up host environment for USB access.
///
/// On Linux this installs udev rules for the fastboot and MediaTek vendor
/// ids; elsewhere it is a no-op, so it is always safe to call.
pub fn host_setup() -> Result<()> {
  #[cfg(target_os = "linux")]
  setup_host_linux()?;

  Ok(())
}

#[cfg(target_os = "linux")]
fn setup_host_linux() -> Result<()> {
  use std::{fs, path::PathBuf, process::Command};

  let rules_path = PathBuf::from("/etc/udev/rules.d/98-crossflash.rules");

  // fastboot vendors plus the MediaTek BROM/Preloader port
  let vendor_ids: [u16; 6] = [0x18d1, 0x0e8d, 0x2717, 0x22d9, 0x22b8, 0x04e8];

  let username = whoami::username()?;
  let rules_content: String = vendor_ids
    .iter()
    .map(|vid| {
      format!(
        "SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{:04x}\", OWNER=\"{}\", MODE=\"0666\"\n",
        vid, username
      )
    })
    .collect();

  let temp_dir = std::env::temp_dir();
  let temp_file_path = temp_dir.join("98-crossflash.rules");
  fs::write(&temp_file_path, &rules_content)?;
  tracing::debug!("created temporary rules file at: {}", temp_file_path.display());

  let pkexec_result = Command::new("pkexec")
    .args(["cp", &temp_file_path.to_string_lossy(), &rules_path.to_string_lossy()])
    .status();

  if let Ok(status) = pkexec_result {
    if status.success() {
      tracing::debug!("successfully installed udev rules using polkit");
      let reload_result = Command::new("pkexec")
        .args(["udevadm", "control", "--reload-rules"])
        .status();

      if let Ok(status) = reload_result {
        if status.success() {
          let _ = Command::new("pkexec").args(["udevadm", "trigger"]).status()?;

          tracing::info!("successfully activated udev rules. Device should now be accessible.");
          let _ = fs::remove_file(&temp_file_path);
          return Ok(());
        }
      }

      tracing::warn!("installed rules but failed to reload automatically. please run:");
      tracing::warn!("  sudo udevadm control --reload-rules && sudo udevadm trigger");
    } else {
      tracing::warn!("polkit authentication failed or was canceled");
    }
  } else {
    tracing::warn!("failed to execute pkexec - polkit might not be available");
  }

  tracing::info!("to install the rules manually, run the following commands:");
  tracing::info!("  sudo cp {} /etc/udev/rules.d/", temp_file_path.display());
  tracing::info!("  sudo udevadm control --reload-rules && sudo udevadm trigger");

  Ok(())
}
