//! BROM→DA loader pipeline.
//!
//! Orchestrates the whole boot chain: handshake, chip identification,
//! optional `SEND_CERT` bypass with its re-enumeration, DA selection and
//! classification, the DA1 upload and jump, the second re-enumeration,
//! readiness, runtime parameters, EMI, and finally DA2, patched through
//! Carbonara when the session calls for it. The terminal states are
//! `Da2Loaded` and `Failed`.

use std::time::Duration;

use crate::{
  transport::{serial::SerialTransport, share, watch, CancelToken, SharedTransport},
  watchdog::Watchdog,
  Callback, Error, Event, Result, RECONNECT_WINDOW,
};

use super::{
  brom::{BromClient, ChipIdentity, DEFAULT_HANDSHAKE_ATTEMPTS},
  chips::ChipRecord,
  da::{await_ready, classify_da, extract_emi, DaProtocol, RuntimeParams, READY_WINDOW},
  dafile::DaFile,
  exploit, ConnAgent, DaMode, ExploitType,
};

/// Pipeline states, in flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LoaderState {
  Disconnected,
  BromHandshaked,
  BromIdentified,
  ExploitPending,
  DaSelected,
  Da1Launched,
  Da1Ready,
  Da2Loaded,
  Failed,
}

/// Inputs to a pipeline run.
pub struct LoaderOptions {
  /// All-in-one `MTK_DOWNLOAD_AGENT` file bytes.
  pub da_file: Vec<u8>,
  /// Preloader image, mined for the EMI block on brom-sourced sessions.
  pub preloader: Option<Vec<u8>>,
  /// Chip-specific `SEND_CERT` bypass image.
  pub cert_payload: Option<Vec<u8>>,
  /// Chip-specific AllinoneSignature shellcode.
  pub shellcode: Option<Vec<u8>>,
  pub handshake_attempts: usize,
  pub runtime: RuntimeParams,
}

impl LoaderOptions {
  pub fn new(da_file: Vec<u8>) -> Self {
    Self {
      da_file,
      preloader: None,
      cert_payload: None,
      shellcode: None,
      handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
      runtime: RuntimeParams::default(),
    }
  }
}

/// What the BROM stage established, consumed by the DA stage.
pub struct BromStageReport {
  pub identity: ChipIdentity,
  pub chip: ChipRecord,
  pub mode: DaMode,
  /// DA1 bytes exactly as transmitted.
  pub da1_image: Vec<u8>,
  /// DA2 payload (signature trimmed) and its load address.
  pub da2_image: Option<Vec<u8>>,
  pub da2_addr: u32,
  /// Whether DA1 was loaded by raw BROM (true) or the Preloader.
  pub brom_sourced: bool,
  /// Whether a `SEND_CERT` pass visibly lowered the target config.
  pub exploited: bool,
}

pub struct DaLoader {
  callback: Option<Callback>,
  cancel: CancelToken,
  state: LoaderState,
  watchdog: Watchdog,
}

impl DaLoader {
  pub fn new(callback: Option<Callback>, cancel: CancelToken) -> Self {
    let watchdog = Watchdog::spawn(cancel.clone());
    Self {
      callback,
      cancel,
      state: LoaderState::Disconnected,
      watchdog,
    }
  }

  pub fn state(&self) -> LoaderState {
    self.state
  }

  fn set_state(&mut self, state: LoaderState) {
    tracing::info!("loader: {:?} -> {:?}", self.state, state);
    self.state = state;
    if let Some(callback) = &self.callback {
      callback(Event::LoaderState(state));
    }
  }

  /// Full pipeline on a serial port. Returns a ready DA2 session.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, opts)))]
  pub fn run(&mut self, port_name: &str, opts: &LoaderOptions) -> Result<Box<dyn DaProtocol>> {
    let outcome = self.run_inner(port_name, opts);
    if outcome.is_err() {
      self.set_state(LoaderState::Failed);
    }
    outcome
  }

  fn run_inner(&mut self, port_name: &str, opts: &LoaderOptions) -> Result<Box<dyn DaProtocol>> {
    let port = share(Box::new(SerialTransport::open(port_name)?));
    let mut brom = BromClient::new(port.clone(), self.cancel.clone());

    let cancel = self.cancel.clone();
    let mut reconnect = move |exclude: Option<String>| -> Result<SharedTransport> {
      let name = watch::wait_for_new_serial(exclude.as_deref(), RECONNECT_WINDOW, &cancel)?;
      Ok(share(Box::new(SerialTransport::open(&name)?)))
    };

    // the watchdog covers each pipeline phase; two overruns fire the
    // cancel token, which the next chunk boundary observes
    self.watchdog.arm(Duration::from_secs(120));
    let report = self.brom_stage(&mut brom, opts, &mut reconnect)?;
    self.watchdog.feed();

    // DA1 took over; the port identity changes underneath us
    let old_identity = brom.port_identity().ok();
    brom.release()?;
    if let Some(callback) = &self.callback {
      callback(Event::Reenumerating);
    }
    self.watchdog.arm(RECONNECT_WINDOW + READY_WINDOW + Duration::from_secs(5));
    let da_port = reconnect(old_identity)?;

    {
      let mut guard = da_port.lock().map_err(|_| Error::IoClosed)?;
      await_ready(guard.as_mut(), &self.cancel, READY_WINDOW)?;
    }
    self.watchdog.feed();

    let mut da: Box<dyn DaProtocol> = match report.mode {
      DaMode::Xml => Box::new(super::xml::XmlDa::new(da_port, self.cancel.clone())),
      _ => Box::new(super::xflash::XFlash::new(da_port, self.cancel.clone())),
    };

    self.watchdog.arm(Duration::from_secs(300));
    self.da_stage(da.as_mut(), &report, opts)?;
    self.watchdog.feed();
    Ok(da)
  }

  /// BROM-side phase: handshake → identify → optional cert bypass →
  /// DA selection → watchdog off → `SEND_DA` → `JUMP_DA`.
  pub fn brom_stage(
    &mut self,
    brom: &mut BromClient,
    opts: &LoaderOptions,
    reconnect: &mut dyn FnMut(Option<String>) -> Result<SharedTransport>,
  ) -> Result<BromStageReport> {
    self.set_state(LoaderState::Disconnected);

    brom.handshake(opts.handshake_attempts)?;
    self.set_state(LoaderState::BromHandshaked);

    let (mut identity, chip) = brom.identify()?;
    let brom_sourced = brom.is_brom_mode();
    self.set_state(LoaderState::BromIdentified);

    // BROM exploit attempts are tolerated failures: no improvement means
    // the DA upload later fails naturally if the bypass was required
    let mut exploited = false;
    if brom_sourced && identity.target_config.0 != 0 {
      if let Some(cert) = &opts.cert_payload {
        self.set_state(LoaderState::ExploitPending);
        let before = identity.target_config.0;

        match self.attempt_cert_bypass(brom, cert, reconnect) {
          Ok(config) => {
            exploited = config.0 == 0 || config.0 < before;
            identity.target_config = config;
            if !exploited {
              tracing::warn!("cert bypass produced no improvement (config {})", config);
            }
          }
          Err(err) => tracing::warn!("cert bypass failed, continuing without it: {}", err),
        }
        self.set_state(LoaderState::BromIdentified);
      } else {
        tracing::warn!(
          "device is secured ({}) and no cert payload was provided",
          identity.target_config
        );
      }
    }

    let da_file = DaFile::parse(&opts.da_file)?;
    let entry = da_file
      .entry_for(identity.hw_code)
      .or_else(|| da_file.entry_for(chip.hw_code))
      .ok_or(Error::UnknownChip(identity.hw_code))?;

    let da1 = entry
      .da1()
      .ok_or_else(|| Error::InvalidArgument("DA entry carries no DA1 region".into()))?;
    let (mode, sig_len) = classify_da(&da1.data, chip.da_mode);
    self.set_state(LoaderState::DaSelected);

    brom.disable_watchdog(chip.watchdog_addr)?;

    let declared = da1.data.len().saturating_sub(sig_len) as u32;
    brom.send_da(da1.load_address, declared, sig_len as u32, &da1.data)?;
    brom.jump_da(da1.load_address)?;
    self.set_state(LoaderState::Da1Launched);

    let da2 = entry.da2();
    Ok(BromStageReport {
      da1_image: da1.data.clone(),
      da2_image: da2.map(|r| r.data[..r.data.len() - r.signature.len()].to_vec()),
      da2_addr: da2.map(|r| r.load_address).unwrap_or(0),
      identity,
      chip,
      mode,
      brom_sourced,
      exploited,
    })
  }

  /// One `SEND_CERT` round: push the payload, ride out the re-enumeration,
  /// re-handshake, and report the fresh target config.
  fn attempt_cert_bypass(
    &mut self,
    brom: &mut BromClient,
    cert: &[u8],
    reconnect: &mut dyn FnMut(Option<String>) -> Result<SharedTransport>,
  ) -> Result<super::TargetConfig> {
    brom.send_cert(cert)?;

    let old_identity = brom.port_identity().ok();
    brom.release()?;
    if let Some(callback) = &self.callback {
      callback(Event::Reenumerating);
    }

    let port = reconnect(old_identity)?;
    *brom = BromClient::new(port, self.cancel.clone());
    brom.handshake(DEFAULT_HANDSHAKE_ATTEMPTS)?;
    brom.get_target_config()
  }

  /// DA-side phase: readiness was awaited by the caller; exchange runtime
  /// parameters, push EMI for brom-sourced sessions, load DA2 (Carbonara
  /// when applicable), then run the chip's DA2-level exploit.
  pub fn da_stage(
    &mut self,
    da: &mut dyn DaProtocol,
    report: &BromStageReport,
    opts: &LoaderOptions,
  ) -> Result<()> {
    da.set_runtime_parameters(&opts.runtime)?;

    let agent = da.conn_agent().unwrap_or(if report.brom_sourced {
      ConnAgent::Brom
    } else {
      ConnAgent::Preloader
    });
    tracing::debug!("connection agent: {:?}", agent);
    self.set_state(LoaderState::Da1Ready);

    // EMI is needed exactly once, and only when raw BROM loaded DA1:
    // preloader-sourced sessions come up with DRAM already initialized
    if report.brom_sourced {
      match opts.preloader.as_deref().map(extract_emi) {
        Some(Ok(emi)) => da.init_ext_ram(&emi)?,
        Some(Err(err)) => return Err(err),
        None => tracing::warn!("brom-sourced session without a preloader; EMI config skipped"),
      }
    }

    let Some(da2) = report.da2_image.as_deref() else {
      return Err(Error::InvalidArgument("DA entry carries no DA2 region".into()));
    };

    let use_carbonara = agent == ConnAgent::Preloader && report.identity.target_config.sbc();
    if use_carbonara {
      let mut patched = da2.to_vec();
      match exploit::carbonara(&report.da1_image, &mut patched) {
        Ok(()) => da.boot_to(report.da2_addr, &patched)?,
        Err(Error::ExploitNotApplicable(reason)) => {
          tracing::warn!("carbonara skipped ({}), uploading DA2 unpatched", reason);
          da.boot_to(report.da2_addr, da2)?;
        }
        Err(err) => return Err(err),
      }
    } else {
      da.boot_to(report.da2_addr, da2)?;
    }
    self.set_state(LoaderState::Da2Loaded);

    if report.chip.exploit == ExploitType::AllinoneSignature {
      match &opts.shellcode {
        Some(shellcode) => exploit::allinone_signature(da, &report.chip, shellcode)?,
        None => tracing::debug!("chip lists AllinoneSignature but no shellcode was provided"),
      }
    }

    Ok(())
  }
}

/// Convenience wrapper: wait ≤ `window` for any MediaTek serial port and
/// run the full pipeline on it.
pub fn run_on_first_port(
  loader: &mut DaLoader,
  opts: &LoaderOptions,
  window: Duration,
) -> Result<Box<dyn DaProtocol>> {
  let name = watch::wait_for_new_serial(None, window, &loader.cancel)?;
  loader.run(&name, opts)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fastboot::mock::MockTransport;
  use crate::mtk::brom::{
    xor16, CMD_GET_HW_CODE, CMD_GET_HW_SW_VER, CMD_GET_ME_ID, CMD_GET_SOC_ID, CMD_GET_TARGET_CONFIG, CMD_JUMP_DA,
    CMD_SEND_CERT, CMD_SEND_DA, CMD_WRITE32,
  };
  use crate::mtk::da::DaPartition;
  use crate::mtk::dafile::testutil::build_da_file;
  use crate::mtk::{ConnAgent, StorageType, TargetConfig};
  use crate::transport::share;

  fn handshake_replies(replies: &mut Vec<Vec<u8>>) {
    replies.push(vec![]); // greeting probe, silent = BROM
    replies.extend([vec![0x5f], vec![0xf5], vec![0xaf], vec![0xfa]]);
  }

  fn identify_replies(replies: &mut Vec<Vec<u8>>, hw_code: u16, config: u32) {
    replies.push(vec![CMD_GET_HW_CODE]);
    replies.push(hw_code.to_be_bytes().to_vec());
    replies.push(vec![0, 0]);

    replies.push(vec![CMD_GET_HW_SW_VER]);
    replies.push(vec![0x8a, 0x00]); // hw_subcode
    replies.push(vec![0xca, 0x00]); // hw_version
    replies.push(vec![0x00, 0x00]); // sw_version
    replies.push(vec![0, 0]);

    replies.push(vec![CMD_GET_TARGET_CONFIG]);
    replies.push(config.to_be_bytes().to_vec());
    replies.push(vec![0, 0]);

    replies.push(vec![CMD_GET_ME_ID]);
    replies.push(16u32.to_be_bytes().to_vec());
    replies.push(vec![0xaa; 16]);
    replies.push(vec![0, 0]);

    replies.push(vec![CMD_GET_SOC_ID]);
    replies.push(32u32.to_be_bytes().to_vec());
    replies.push(vec![0xbb; 32]);
    replies.push(vec![0, 0]);
  }

  fn da_upload_replies(replies: &mut Vec<Vec<u8>>, da1: &[u8]) {
    // watchdog write32
    replies.push(vec![CMD_WRITE32]);
    replies.push(vec![0, 0]);
    replies.push(vec![0, 0]);

    // send_da
    replies.push(vec![CMD_SEND_DA]);
    replies.push(vec![0, 0]);
    replies.push(xor16(da1).to_be_bytes().to_vec());
    replies.push(vec![0, 0]);

    // jump_da
    replies.push(vec![CMD_JUMP_DA]);
    replies.push(vec![0, 0]);
  }

  fn client_for(replies: Vec<Vec<u8>>) -> BromClient {
    let refs: Vec<&[u8]> = replies.iter().map(|r| r.as_slice()).collect();
    let (mock, _) = MockTransport::scripted(&refs);
    BromClient::new(share(Box::new(mock)), CancelToken::new())
  }

  fn opts_with_da(hw_code: u16) -> (LoaderOptions, Vec<u8>) {
    let da1 = vec![0x11u8; 0x400];
    let da2 = vec![0x22u8; 0x400];
    let file = build_da_file(hw_code, &da1, 0, &da2, 0);
    (LoaderOptions::new(file), da1)
  }

  #[test]
  fn open_device_runs_straight_to_jump() {
    let (opts, da1) = opts_with_da(0x0766);

    let mut replies = vec![];
    handshake_replies(&mut replies);
    identify_replies(&mut replies, 0x0766, 0);
    da_upload_replies(&mut replies, &da1);

    let mut brom = client_for(replies);
    let mut loader = DaLoader::new(None, CancelToken::new());
    let mut reconnect = |_: Option<String>| -> Result<SharedTransport> { panic!("no re-enumeration expected") };

    let report = loader.brom_stage(&mut brom, &opts, &mut reconnect).unwrap();

    assert_eq!(loader.state(), LoaderState::Da1Launched);
    assert!(report.brom_sourced);
    assert!(!report.exploited);
    assert_eq!(report.chip.name, "MT6765");
    assert_eq!(report.da1_image, da1);
    assert!(report.da2_image.is_some());
  }

  #[test]
  fn secured_device_takes_the_cert_detour_and_reads_config_again() {
    let (mut opts, da1) = opts_with_da(0x0766);
    opts.cert_payload = Some(vec![0xce; 64]);

    let mut replies = vec![];
    handshake_replies(&mut replies);
    identify_replies(&mut replies, 0x0766, TargetConfig::SBC | TargetConfig::DAA);
    // send_cert on the first port
    replies.push(vec![CMD_SEND_CERT]);
    replies.push(vec![0, 0]);
    replies.push(vec![0, 0]);

    let mut brom = client_for(replies);

    // the re-enumerated port answers a fresh handshake and an open config,
    // then carries the DA upload
    let mut second = vec![];
    handshake_replies(&mut second);
    second.push(vec![CMD_GET_TARGET_CONFIG]);
    second.push(0u32.to_be_bytes().to_vec());
    second.push(vec![0, 0]);
    da_upload_replies(&mut second, &da1);

    let refs: Vec<&[u8]> = second.iter().map(|r| r.as_slice()).collect();
    let (second_mock, _) = MockTransport::scripted(&refs);
    let mut second_port = Some(share(Box::new(second_mock) as Box<dyn crate::transport::Transport>));

    let mut reconnects = 0;
    let mut reconnect = |_: Option<String>| -> Result<SharedTransport> {
      reconnects += 1;
      Ok(second_port.take().expect("only one re-enumeration expected"))
    };

    let mut loader = DaLoader::new(None, CancelToken::new());
    let report = loader.brom_stage(&mut brom, &opts, &mut reconnect).unwrap();

    assert_eq!(reconnects, 1);
    assert!(report.exploited);
    assert_eq!(report.identity.target_config.0, 0);
    assert_eq!(loader.state(), LoaderState::Da1Launched);
  }

  #[test]
  fn failed_cert_bypass_is_tolerated() {
    let (mut opts, da1) = opts_with_da(0x0766);
    opts.cert_payload = Some(vec![0xce; 64]);

    let config = TargetConfig::SBC | TargetConfig::DAA;
    let mut replies = vec![];
    handshake_replies(&mut replies);
    identify_replies(&mut replies, 0x0766, config);
    replies.push(vec![CMD_SEND_CERT]);
    replies.push(vec![0, 0]);
    replies.push(vec![0, 0]);

    let mut brom = client_for(replies);

    // after re-enumeration the config is unchanged: no improvement
    let mut second = vec![];
    handshake_replies(&mut second);
    second.push(vec![CMD_GET_TARGET_CONFIG]);
    second.push(config.to_be_bytes().to_vec());
    second.push(vec![0, 0]);
    da_upload_replies(&mut second, &da1);

    let refs: Vec<&[u8]> = second.iter().map(|r| r.as_slice()).collect();
    let (second_mock, _) = MockTransport::scripted(&refs);
    let mut second_port = Some(share(Box::new(second_mock) as Box<dyn crate::transport::Transport>));
    let mut reconnect =
      |_: Option<String>| -> Result<SharedTransport> { Ok(second_port.take().expect("one re-enumeration")) };

    let mut loader = DaLoader::new(None, CancelToken::new());
    let report = loader.brom_stage(&mut brom, &opts, &mut reconnect).unwrap();

    // pipeline continued to jump despite the unimproved config
    assert!(!report.exploited);
    assert_eq!(loader.state(), LoaderState::Da1Launched);
  }

  #[test]
  fn missing_da_entry_is_an_unknown_chip() {
    let (opts, _) = opts_with_da(0x0813); // DA only knows MT6785

    let mut replies = vec![];
    handshake_replies(&mut replies);
    identify_replies(&mut replies, 0x0766, 0); // device is MT6765

    let mut brom = client_for(replies);
    let mut loader = DaLoader::new(None, CancelToken::new());
    let mut reconnect = |_: Option<String>| -> Result<SharedTransport> { panic!("no re-enumeration expected") };

    let res = loader.brom_stage(&mut brom, &opts, &mut reconnect);
    assert!(matches!(res, Err(Error::UnknownChip(0x0766))));
  }

  /// DA protocol double recording the da_stage call sequence.
  #[derive(Default)]
  struct ScriptedDa {
    agent: Option<ConnAgent>,
    calls: Vec<String>,
    booted: Vec<(u32, Vec<u8>)>,
  }

  impl DaProtocol for ScriptedDa {
    fn conn_agent(&mut self) -> Result<ConnAgent> {
      self.calls.push("conn_agent".into());
      Ok(self.agent.unwrap_or(ConnAgent::Brom))
    }
    fn set_runtime_parameters(&mut self, _params: &RuntimeParams) -> Result<()> {
      self.calls.push("runtime".into());
      Ok(())
    }
    fn boot_to(&mut self, addr: u32, data: &[u8]) -> Result<()> {
      self.calls.push("boot_to".into());
      self.booted.push((addr, data.to_vec()));
      Ok(())
    }
    fn init_ext_ram(&mut self, _emi: &[u8]) -> Result<()> {
      self.calls.push("emi".into());
      Ok(())
    }
    fn storage(&mut self) -> Result<StorageType> {
      Ok(StorageType::Emmc)
    }
    fn read_partition_table(&mut self) -> Result<Vec<DaPartition>> {
      Ok(vec![])
    }
    fn read_partition(&mut self, _: &str, _: Option<u64>, _: &mut dyn FnMut(u64, u64)) -> Result<Vec<u8>> {
      Ok(vec![])
    }
    fn write_partition(&mut self, _: &str, _: &[u8], _: &mut dyn FnMut(u64, u64)) -> Result<()> {
      Ok(())
    }
    fn erase_partition(&mut self, _: &str) -> Result<()> {
      Ok(())
    }
    fn read32(&mut self, _: u32) -> Result<u32> {
      Ok(0)
    }
    fn write32(&mut self, _: u32, _: u32) -> Result<()> {
      self.calls.push("write32".into());
      Ok(())
    }
    fn reboot(&mut self) -> Result<()> {
      Ok(())
    }
    fn shutdown(&mut self) -> Result<()> {
      Ok(())
    }
  }

  fn report_for(chip_code: u16, config: u32, brom_sourced: bool) -> BromStageReport {
    let chip = crate::mtk::chips::lookup_chip(chip_code).unwrap().clone();
    BromStageReport {
      identity: ChipIdentity {
        hw_code: chip_code,
        hw_subcode: 0x8a00,
        hw_version: 0xca00,
        sw_version: 0,
        target_config: TargetConfig(config),
        me_id: vec![],
        soc_id: vec![],
        verified: true,
      },
      chip,
      mode: DaMode::Xml,
      da1_image: vec![0x11; 0x400],
      da2_image: Some(vec![0x22; 0x400]),
      da2_addr: 0x4000_0000,
      brom_sourced,
      exploited: false,
    }
  }

  #[test]
  fn brom_sourced_session_sends_emi_exactly_once() {
    let mut preloader = vec![0u8; 0x100];
    preloader.extend_from_slice(b"MTK_BLOADER_INFO_v20");
    preloader.extend_from_slice(&[0x5a; 32]);

    let mut opts = LoaderOptions::new(vec![]);
    opts.preloader = Some(preloader);

    let mut da = ScriptedDa {
      agent: Some(ConnAgent::Brom),
      ..Default::default()
    };

    let mut loader = DaLoader::new(None, CancelToken::new());
    let report = report_for(0x0766, 0, true);
    loader.da_stage(&mut da, &report, &opts).unwrap();

    assert_eq!(loader.state(), LoaderState::Da2Loaded);
    assert_eq!(da.calls.iter().filter(|c| *c == "emi").count(), 1);
    // runtime params exchanged before EMI, DA2 uploaded after
    let emi_at = da.calls.iter().position(|c| c == "emi").unwrap();
    let runtime_at = da.calls.iter().position(|c| c == "runtime").unwrap();
    let boot_at = da.calls.iter().position(|c| c == "boot_to").unwrap();
    assert!(runtime_at < emi_at && emi_at < boot_at);
  }

  #[test]
  fn preloader_sourced_sbc_session_uploads_a_carbonara_patched_da2() {
    let opts = LoaderOptions::new(vec![]);
    let mut da = ScriptedDa {
      agent: Some(ConnAgent::Preloader),
      ..Default::default()
    };

    let mut loader = DaLoader::new(None, CancelToken::new());
    let report = report_for(0x0766, TargetConfig::SBC, false);
    loader.da_stage(&mut da, &report, &opts).unwrap();

    let (addr, uploaded) = &da.booted[0];
    assert_eq!(*addr, 0x4000_0000);

    // the uploaded DA2 differs from the original exactly at the digest
    use sha2::Digest as _;
    let expected = sha2::Sha256::digest(&report.da1_image);
    let at = exploit::DA2_VERIFY_HASH_OFFSET;
    assert_eq!(&uploaded[at..at + 32], expected.as_slice());
    assert!(da.calls.iter().all(|c| c != "emi"));
  }

  #[test]
  fn allinone_chip_gets_its_da2_exploit_run() {
    let mut opts = LoaderOptions::new(vec![]);
    opts.shellcode = Some(vec![0xde, 0xad, 0xbe, 0xef]);

    let mut da = ScriptedDa {
      agent: Some(ConnAgent::Preloader),
      ..Default::default()
    };

    let mut loader = DaLoader::new(None, CancelToken::new());
    let report = report_for(0x0813, 0, false); // MT6785: AllinoneSignature
    loader.da_stage(&mut da, &report, &opts).unwrap();

    assert_eq!(loader.state(), LoaderState::Da2Loaded);
    assert!(da.calls.iter().any(|c| c == "write32"));
  }

  #[test]
  fn failing_runtime_parameters_abort_the_stage() {
    struct RefusingDa(ScriptedDa);
    impl DaProtocol for RefusingDa {
      fn conn_agent(&mut self) -> Result<ConnAgent> {
        self.0.conn_agent()
      }
      fn set_runtime_parameters(&mut self, _params: &RuntimeParams) -> Result<()> {
        Err(Error::RuntimeParametersRefused(0x2004))
      }
      fn boot_to(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.0.boot_to(addr, data)
      }
      fn init_ext_ram(&mut self, emi: &[u8]) -> Result<()> {
        self.0.init_ext_ram(emi)
      }
      fn storage(&mut self) -> Result<StorageType> {
        self.0.storage()
      }
      fn read_partition_table(&mut self) -> Result<Vec<DaPartition>> {
        self.0.read_partition_table()
      }
      fn read_partition(&mut self, n: &str, s: Option<u64>, p: &mut dyn FnMut(u64, u64)) -> Result<Vec<u8>> {
        self.0.read_partition(n, s, p)
      }
      fn write_partition(&mut self, n: &str, d: &[u8], p: &mut dyn FnMut(u64, u64)) -> Result<()> {
        self.0.write_partition(n, d, p)
      }
      fn erase_partition(&mut self, n: &str) -> Result<()> {
        self.0.erase_partition(n)
      }
      fn read32(&mut self, a: u32) -> Result<u32> {
        self.0.read32(a)
      }
      fn write32(&mut self, a: u32, v: u32) -> Result<()> {
        self.0.write32(a, v)
      }
      fn reboot(&mut self) -> Result<()> {
        self.0.reboot()
      }
      fn shutdown(&mut self) -> Result<()> {
        self.0.shutdown()
      }
    }

    let opts = LoaderOptions::new(vec![]);
    let mut da = RefusingDa(ScriptedDa::default());
    let mut loader = DaLoader::new(None, CancelToken::new());
    let report = report_for(0x0766, 0, false);

    let res = loader.da_stage(&mut da, &report, &opts);
    assert!(matches!(res, Err(Error::RuntimeParametersRefused(0x2004))));
    assert!(da.0.booted.is_empty());
  }
}
