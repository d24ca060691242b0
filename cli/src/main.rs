mod monitoring;

use clap::{Parser, Subcommand};
use crossflash::{
  fastboot::FastbootSession,
  mtk::{
    da::{set_bootloader_lock, DaProtocol},
    loader::{DaLoader, LoaderOptions},
  },
  payload::PayloadReader,
  remote::{FlashReport, RemotePayload},
  sparse::{SparseReader, TransferChunker},
  CancelToken, Event,
};
use std::{
  fs,
  fs::File,
  io::{BufWriter, Write},
  path::PathBuf,
  sync::Arc,
  time::Instant,
};

#[derive(Parser, Debug)]
#[command(
  version = "0.1.0",
  about = "cross-vendor Android flashing and recovery toolkit",
  long_about = None
)]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List connected flashing-capable USB devices
  Devices {
    /// Print the device list as JSON
    #[arg(long, action)]
    json: bool,
  },
  /// Query fastboot variables
  Getvar {
    /// Variable name, or `all`
    name: String,
  },
  /// Flash an image to a partition over fastboot
  Flash {
    partition: String,
    image: PathBuf,
  },
  /// Erase a partition over fastboot
  Erase { partition: String },
  /// Reboot the device, optionally into another mode
  Reboot {
    /// One of: bootloader, fastboot, recovery
    target: Option<String>,
  },
  /// Select the active A/B slot
  SetActive { slot: String },
  /// Unlock the bootloader (`flashing unlock`)
  Unlock,
  /// Lock the bootloader (`flashing lock`)
  Lock,
  /// Raw `oem` command passthrough
  Oem { args: Vec<String> },
  /// Inspect or extract a local OTA payload (payload.bin or OTA zip)
  Payload {
    #[command(subcommand)]
    command: PayloadCommand,
  },
  /// Work with a remote OTA zip over HTTP range requests
  Remote {
    #[command(subcommand)]
    command: RemoteCommand,
  },
  /// MediaTek BROM/DA operations
  Mtk {
    #[command(subcommand)]
    command: MtkCommand,
  },
  /// Inspect or unpack Android Sparse images
  Image {
    #[command(subcommand)]
    command: ImageCommand,
  },
  /// Install host udev rules for the supported devices (Linux)
  Setup,
}

#[derive(Subcommand, Debug)]
enum PayloadCommand {
  /// List the partitions a payload carries
  Partitions {
    file: PathBuf,
    #[arg(long, action)]
    json: bool,
  },
  /// Extract one partition image
  Extract {
    file: PathBuf,
    #[arg(short, long)]
    partition: String,
    #[arg(short, long)]
    out: PathBuf,
  },
}

#[derive(Subcommand, Debug)]
enum RemoteCommand {
  /// List the partitions of a remote OTA zip
  Partitions {
    url: String,
    #[arg(long, action)]
    json: bool,
  },
  /// Stream-extract one partition from a remote OTA zip
  Extract {
    url: String,
    #[arg(short, long)]
    partition: String,
    #[arg(short, long)]
    out: PathBuf,
  },
  /// Stream one partition from a remote OTA zip straight onto a fastboot device
  Flash {
    url: String,
    #[arg(short, long)]
    partition: String,
  },
}

#[derive(clap::Args, Debug)]
struct MtkSession {
  /// Serial port of the BROM/Preloader (e.g. /dev/ttyACM0)
  #[arg(long)]
  port: String,
  /// All-in-one MTK_DOWNLOAD_AGENT file
  #[arg(long)]
  da: PathBuf,
  /// Preloader image, used for EMI init on BROM-sourced sessions
  #[arg(long)]
  preloader: Option<PathBuf>,
  /// SEND_CERT bypass payload for secured chips
  #[arg(long)]
  cert: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum MtkCommand {
  /// Load the DA and print the partition table
  Partitions {
    #[command(flatten)]
    session: MtkSession,
    #[arg(long, action)]
    json: bool,
  },
  /// Read a partition to a file
  Read {
    #[command(flatten)]
    session: MtkSession,
    #[arg(short, long)]
    partition: String,
    #[arg(short, long)]
    out: PathBuf,
  },
  /// Write a file to a partition
  Write {
    #[command(flatten)]
    session: MtkSession,
    #[arg(short, long)]
    partition: String,
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,
  },
  /// Erase a partition
  Erase {
    #[command(flatten)]
    session: MtkSession,
    #[arg(short, long)]
    partition: String,
  },
  /// Change the bootloader lock state
  Lockstate {
    #[command(flatten)]
    session: MtkSession,
    /// `lock` or `unlock`
    state: String,
    /// Mechanism: `seccfg` (default) or `fastboot`
    #[arg(long)]
    method: Option<String>,
  },
  /// Load the DA and reboot the device
  Reboot {
    #[command(flatten)]
    session: MtkSession,
  },
}

#[derive(Subcommand, Debug)]
enum ImageCommand {
  /// Print sparse header information and the transfer-chunk count
  Info {
    file: PathBuf,
    /// Byte budget used for the chunk preview
    #[arg(long, default_value = "268435456")]
    budget: usize,
  },
  /// Decompress a sparse image to a raw file
  Unsparse {
    file: PathBuf,
    #[arg(short, long)]
    out: PathBuf,
  },
}

fn main() {
  monitoring::init_logger();

  let args = Args::parse();
  if let Err(err) = run(args.command) {
    tracing::error!("{}", err);
    std::process::exit(1);
  }
}

fn progress_callback() -> crossflash::Callback {
  let last = std::sync::Mutex::new(Instant::now());
  Arc::new(move |event: Event| match event {
    Event::FlashProgress(progress) => {
      let mut last = last.lock().unwrap();
      if last.elapsed().as_millis() >= 500 || progress.percent >= 100.0 {
        *last = Instant::now();
        tracing::info!(
          "{}: {:.1}% ({}/{} bytes, chunk {}/{}, {:.1} MiB/s)",
          progress.partition,
          progress.percent,
          progress.bytes_sent,
          progress.total_bytes,
          progress.chunk_index + 1,
          progress.chunk_count.max(1),
          progress.speed_bps / (1024.0 * 1024.0)
        );
      }
    }
    Event::FastbootInfo(line) => tracing::info!("device: {}", line.trim_end()),
    Event::LoaderState(state) => tracing::info!("loader state: {:?}", state),
    other => tracing::debug!("{:?}", other),
  })
}

fn fastboot_session() -> crossflash::Result<FastbootSession> {
  FastbootSession::open_first(Some(progress_callback()))
}

fn mtk_session(session: &MtkSession) -> crossflash::Result<Box<dyn DaProtocol>> {
  let mut opts = LoaderOptions::new(fs::read(&session.da)?);
  opts.preloader = session.preloader.as_ref().map(fs::read).transpose()?;
  opts.cert_payload = session.cert.as_ref().map(fs::read).transpose()?;

  let mut loader = DaLoader::new(Some(progress_callback()), CancelToken::new());
  loader.run(&session.port, &opts)
}

fn print_progress(done: u64, total: u64) {
  if total > 0 && (done == total || done % (8 * 1024 * 1024) < 64 * 1024) {
    tracing::info!("{}/{} bytes ({:.1}%)", done, total, done as f64 * 100.0 / total as f64);
  }
}

fn run(command: Command) -> crossflash::Result<()> {
  match command {
    Command::Devices { json } => {
      let devices = crossflash::list_usb_devices()?;
      if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
      } else if devices.is_empty() {
        tracing::warn!("no flashing-capable devices found");
      } else {
        for device in devices {
          println!(
            "{:04x}:{:04x}  {:?}{}{}",
            device.vendor_id,
            device.product_id,
            device.vendor,
            device.serial.as_deref().map(|s| format!("  serial={s}")).unwrap_or_default(),
            if device.fastboot { "  [fastboot]" } else { "" },
          );
        }
      }
    }

    Command::Getvar { name } => {
      let mut session = fastboot_session()?;
      if name == "all" {
        let mut variables: Vec<_> = session.variables().iter().collect();
        variables.sort();
        for (key, value) in variables {
          println!("{key}: {value}");
        }
      } else {
        println!("{}", session.getvar(&name)?);
      }
    }

    Command::Flash { partition, image } => {
      let mut session = fastboot_session()?;
      let started = Instant::now();
      session.flash_file(&partition, &image)?;
      tracing::info!("flashed {} in {:.1}s", partition, started.elapsed().as_secs_f64());
    }

    Command::Erase { partition } => {
      fastboot_session()?.erase(&partition)?;
    }

    Command::Reboot { target } => {
      let mut session = fastboot_session()?;
      match target.as_deref() {
        None => session.reboot()?,
        Some("bootloader") => session.reboot_bootloader()?,
        Some("fastboot") => session.reboot_fastboot()?,
        Some("recovery") => session.reboot_recovery()?,
        Some(other) => {
          return Err(crossflash::Error::InvalidArgument(format!(
            "unknown reboot target: {other}"
          )))
        }
      }
    }

    Command::SetActive { slot } => {
      fastboot_session()?.set_active(&slot)?;
      tracing::info!("active slot set to {}", slot);
    }

    Command::Unlock => {
      fastboot_session()?.unlock()?;
      tracing::info!("unlock requested - confirm on the device if prompted");
    }

    Command::Lock => {
      fastboot_session()?.lock()?;
    }

    Command::Oem { args } => {
      let reply = fastboot_session()?.oem(&args.join(" "))?;
      if !reply.is_empty() {
        println!("{reply}");
      }
    }

    Command::Payload { command } => run_payload(command)?,
    Command::Remote { command } => run_remote(command)?,
    Command::Mtk { command } => run_mtk(command)?,
    Command::Image { command } => run_image(command)?,

    Command::Setup => crossflash::host_setup()?,
  }

  Ok(())
}

fn open_local_payload(file: &PathBuf) -> crossflash::Result<Box<dyn LocalPayload>> {
  if file.extension().map(|e| e == "zip").unwrap_or(false) {
    Ok(Box::new(PayloadReader::open_zip_file(file)?))
  } else {
    Ok(Box::new(PayloadReader::open_file(file)?))
  }
}

/// Object-safe view over the two local payload reader types.
trait LocalPayload {
  fn partitions(&self) -> &[crossflash::payload::PartitionUpdate];
  fn extract(
    &mut self,
    name: &str,
    out: &mut (dyn WriteSeek),
    cancel: &CancelToken,
  ) -> crossflash::Result<u64>;
}

trait WriteSeek: Write + std::io::Seek {}
impl<T: Write + std::io::Seek> WriteSeek for T {}

impl<S: crossflash::payload::ByteSource> LocalPayload for PayloadReader<S> {
  fn partitions(&self) -> &[crossflash::payload::PartitionUpdate] {
    PayloadReader::partitions(self)
  }

  fn extract(
    &mut self,
    name: &str,
    out: &mut (dyn WriteSeek),
    cancel: &CancelToken,
  ) -> crossflash::Result<u64> {
    self.extract_partition(name, &mut WriteSeekAdapter(out), cancel, print_progress)
  }
}

/// Adapts the trait object back into the generic `Write + Seek` bound.
struct WriteSeekAdapter<'a>(&'a mut dyn WriteSeek);

impl Write for WriteSeekAdapter<'_> {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.0.write(buf)
  }
  fn flush(&mut self) -> std::io::Result<()> {
    self.0.flush()
  }
}

impl std::io::Seek for WriteSeekAdapter<'_> {
  fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
    self.0.seek(pos)
  }
}

fn run_payload(command: PayloadCommand) -> crossflash::Result<()> {
  match command {
    PayloadCommand::Partitions { file, json } => {
      let reader = open_local_payload(&file)?;
      if json {
        println!("{}", serde_json::to_string_pretty(reader.partitions())?);
      } else {
        for partition in reader.partitions() {
          println!("{}  {} bytes  {} ops", partition.name, partition.size, partition.operations.len());
        }
      }
    }
    PayloadCommand::Extract { file, partition, out } => {
      let mut reader = open_local_payload(&file)?;
      let mut output = BufWriter::new(File::create(&out)?);
      let written = reader.extract(&partition, &mut output, &CancelToken::new())?;
      output.flush()?;
      tracing::info!("extracted {} ({} bytes) to {}", partition, written, out.display());
    }
  }
  Ok(())
}

fn run_remote(command: RemoteCommand) -> crossflash::Result<()> {
  match command {
    RemoteCommand::Partitions { url, json } => {
      let remote = RemotePayload::open(&url)?;
      if let Some(expires) = remote.expires_at() {
        tracing::info!("signed url expires at {:?}", expires);
      }
      if json {
        println!("{}", serde_json::to_string_pretty(remote.partitions())?);
      } else {
        for partition in remote.partitions() {
          println!("{}  {} bytes  {} ops", partition.name, partition.size, partition.operations.len());
        }
      }
    }

    RemoteCommand::Extract { url, partition, out } => {
      let mut remote = RemotePayload::open(&url)?;
      let mut output = BufWriter::new(File::create(&out)?);
      let written = remote.extract_partition(&partition, &mut output, &CancelToken::new(), print_progress)?;
      output.flush()?;
      tracing::info!("extracted {} ({} bytes) to {}", partition, written, out.display());
    }

    RemoteCommand::Flash { url, partition } => {
      let mut remote = RemotePayload::open(&url)?;
      let session = fastboot_session()?;

      let target = partition.clone();
      let report = remote.flash_partition(&partition, &CancelToken::new(), print_progress, move |path| {
        let mut session = session;
        let started = Instant::now();
        session.flash_file(&target, path)?;
        Ok(FlashReport {
          success: true,
          bytes_written: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
          elapsed_seconds: started.elapsed().as_secs_f64(),
        })
      })?;

      tracing::info!(
        "flashed {} ({} bytes in {:.1}s)",
        partition,
        report.bytes_written,
        report.elapsed_seconds
      );
    }
  }
  Ok(())
}

fn run_mtk(command: MtkCommand) -> crossflash::Result<()> {
  match command {
    MtkCommand::Partitions { session, json } => {
      let mut da = mtk_session(&session)?;
      let partitions = da.read_partition_table()?;
      if json {
        println!("{}", serde_json::to_string_pretty(&partitions)?);
      } else {
        for partition in partitions {
          println!(
            "{}  start={}  sectors={}  {} bytes  {}",
            partition.name, partition.start_sector, partition.sector_count, partition.size, partition.part_type
          );
        }
      }
    }

    MtkCommand::Read {
      session,
      partition,
      out,
    } => {
      let mut da = mtk_session(&session)?;
      let data = da.read_partition(&partition, None, &mut print_progress)?;
      fs::write(&out, &data)?;
      tracing::info!("read {} ({} bytes) to {}", partition, data.len(), out.display());
    }

    MtkCommand::Write {
      session,
      partition,
      input,
    } => {
      let mut da = mtk_session(&session)?;
      let data = fs::read(&input)?;
      da.write_partition(&partition, &data, &mut print_progress)?;
      tracing::info!("wrote {} bytes to {}", data.len(), partition);
    }

    MtkCommand::Erase { session, partition } => {
      let mut da = mtk_session(&session)?;
      da.erase_partition(&partition)?;
    }

    MtkCommand::Lockstate {
      session,
      state,
      method,
    } => {
      let lock = match state.as_str() {
        "lock" => true,
        "unlock" => false,
        other => {
          return Err(crossflash::Error::InvalidArgument(format!(
            "lock state must be `lock` or `unlock`, got {other}"
          )))
        }
      };
      let mut da = mtk_session(&session)?;
      set_bootloader_lock(da.as_mut(), lock, method.as_deref())?;
    }

    MtkCommand::Reboot { session } => {
      let mut da = mtk_session(&session)?;
      da.reboot()?;
    }
  }
  Ok(())
}

fn run_image(command: ImageCommand) -> crossflash::Result<()> {
  match command {
    ImageCommand::Info { file, budget } => {
      let handle = File::open(&file)?;
      match SparseReader::open(handle) {
        Ok(reader) => {
          let header = reader.header();
          println!(
            "sparse image: block_size={} total_blocks={} total_chunks={} ({} bytes raw)",
            header.block_size,
            header.total_blocks,
            header.total_chunks,
            header.block_size as u64 * header.total_blocks as u64,
          );
        }
        Err(_) => {
          let len = fs::metadata(&file)?.len();
          println!("raw image: {len} bytes");
        }
      }

      let mut chunker = TransferChunker::new(File::open(&file)?, budget)?;
      println!(
        "transfer plan at budget {}: {} chunks, {} bytes on the wire",
        budget,
        chunker.total(),
        chunker.total_transfer_bytes()
      );
      while let Some(chunk) = chunker.next_chunk()? {
        tracing::debug!("chunk {}/{}: {} bytes", chunk.index + 1, chunk.total, chunk.size);
      }
    }

    ImageCommand::Unsparse { file, out } => {
      let mut reader = SparseReader::open(File::open(&file)?)?;
      let mut output = BufWriter::new(File::create(&out)?);
      let written = reader.unsparse_to(&mut output)?;
      output.flush()?;
      tracing::info!("wrote {} bytes to {}", written, out.display());
    }
  }
  Ok(())
}
