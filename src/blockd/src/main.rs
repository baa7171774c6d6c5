use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::info;
use structopt::StructOpt;

use blockd::config::Config;
use blockd::device::{Device, DeviceRequest, DeviceResponse};
use blockd::driver::Lower;
use blockd::ramdisk::Ramdisk;
use blockd::server::ClientFifo;
use blockd::vmo::Vmo;
use interface::{encode_op, BlockFifoRequest, Opcode, RequestFlags};

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "blockd")]
struct Opts {
    /// Config path; built-in defaults apply when the file does not exist.
    #[structopt(short, long, default_value = "blockd.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let opts = Opts::from_args();
    let config = if opts.config.exists() {
        Config::from_path(&opts.config)?
    } else {
        Config::default()
    };

    // read log config from env "BLOCKD_LOG", with the configured default level
    init_env_log("BLOCKD_LOG", &config.default_log_level);

    let ramdisk = Ramdisk::new(
        config.ramdisk.block_size,
        config.ramdisk.block_count,
        config.ramdisk.max_transfer_size,
    )
    .context("create ramdisk")?;
    let device = Device::new(Lower::Modern(Arc::new(ramdisk)));

    let geometry = match device.ioctl(DeviceRequest::GetInfo)? {
        DeviceResponse::Info(info) => info,
        _ => bail!("unexpected response to GetInfo"),
    };
    info!(
        "serving ramdisk: {} blocks of {} bytes, max transfer {}",
        geometry.block_count, geometry.block_size, geometry.max_transfer_size
    );

    run_workload(&device, &config)?;
    device.release();
    Ok(())
}

fn init_env_log(filter_env: &str, default_level: &str) {
    use chrono::Utc;
    use std::io::Write;

    let env = env_logger::Env::new().filter_or(filter_env, default_level);
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
                level_style.value(record.level()),
                record.file().unwrap_or("<unnamed>"),
                record.line().unwrap_or(0),
                &record.args()
            )
        })
        .init();
}

/// Push a configured write-then-read-back workload through a full session,
/// verifying every byte on the way out.
fn run_workload(device: &Arc<Device>, config: &Config) -> Result<()> {
    let block_size = u64::from(config.ramdisk.block_size);
    let transfer = u64::from(config.workload.transfer_size);
    let device_bytes = config.ramdisk.block_count * block_size;
    if transfer == 0 || transfer % block_size != 0 || transfer > device_bytes {
        bail!("transfer_size must be a block multiple that fits the device");
    }

    let session = match device.ioctl(DeviceRequest::GetFifos)? {
        DeviceResponse::Fifo(fifo) => fifo,
        _ => bail!("unexpected response to GetFifos"),
    };
    let vmo = Arc::new(Vmo::create(transfer)?);
    let region_id = match device.ioctl(DeviceRequest::AttachVmo(Arc::clone(&vmo)))? {
        DeviceResponse::RegionId(id) => id,
        _ => bail!("unexpected response to AttachVmo"),
    };
    let txn_id = match device.ioctl(DeviceRequest::AllocTxn)? {
        DeviceResponse::TxnId(id) => id,
        _ => bail!("unexpected response to AllocTxn"),
    };

    let rounds = config.workload.total_bytes / transfer;
    let slots = device_bytes / transfer;
    let mut pattern = vec![0u8; transfer as usize];
    let zeroes = vec![0u8; transfer as usize];
    let start = Instant::now();

    for round in 0..rounds {
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = (round as usize).wrapping_add(i) as u8;
        }
        let dev_offset = (round % slots) * transfer;

        vmo.write_at(&pattern, 0)?;
        submit(
            &session,
            BlockFifoRequest {
                txn_id,
                region_id,
                op: encode_op(Opcode::Write, RequestFlags::TXN_END),
                length: transfer,
                vmo_offset: 0,
                dev_offset,
                ..Default::default()
            },
        )?;

        vmo.write_at(&zeroes, 0)?;
        submit(
            &session,
            BlockFifoRequest {
                txn_id,
                region_id,
                op: encode_op(Opcode::Read, RequestFlags::TXN_END),
                length: transfer,
                vmo_offset: 0,
                dev_offset,
                ..Default::default()
            },
        )?;

        let mut readback = vec![0u8; transfer as usize];
        vmo.read_at(&mut readback, 0)?;
        if readback != pattern {
            bail!("read back the wrong data in round {}", round);
        }
    }

    let elapsed = start.elapsed();
    info!(
        "workload done: {} rounds of {} bytes in {:.2?}",
        rounds, transfer, elapsed
    );

    device.ioctl(DeviceRequest::Sync)?;
    device.ioctl(DeviceRequest::FreeTxn(txn_id))?;
    device.ioctl(DeviceRequest::FifoClose)?;
    Ok(())
}

fn submit(session: &ClientFifo, request: BlockFifoRequest) -> Result<()> {
    session.write(&request)?;
    let response = session.read_one()?;
    let status = response.status()?;
    if !status.is_ok() {
        bail!("request failed: {}", status);
    }
    Ok(())
}
