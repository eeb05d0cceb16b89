// Commandline argument parser using clap for BalanceSock

use crate::config::SessionConfig;

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone, Default)]
#[clap(version, about)]
pub struct SockArgs {
    /// Session configuration file, in RON
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use simulated socks instead of serial ports
    #[arg(long)]
    pub simulate: bool,

    /// Address of the head-mounted display, as host:port
    #[arg(long)]
    pub hmd: Option<String>,

    /// Log feedback instead of sending it to the HMD
    #[arg(long)]
    pub bypass_hmd: bool,

    /// Serve the device handshake on this address
    #[arg(long)]
    pub handshake_bind: Option<String>,

    /// Pick ports in a terminal UI instead of waiting for the selection file
    #[arg(long)]
    pub tui_select: bool,

    /// Directory for frame logs and their side-channel files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,
}

impl SockArgs {
    /// Override `config` with whatever was given on the command line.
    pub fn apply(&self, config: &mut SessionConfig) {
        if let Some(hmd) = &self.hmd {
            config.hmd_addr = hmd.clone();
        }
        if self.bypass_hmd {
            config.bypass_hmd = true;
        }
        if let Some(bind) = &self.handshake_bind {
            config.handshake_bind = Some(bind.clone());
        }
        if let Some(dir) = &self.log_dir {
            config.device.log_dir = dir.clone();
        }
    }
}
