//! Operator console: reads commands from stdin and drives the socks, the
//! handshake server and the exercise program.
//!
//! Example:
//!
//!     cargo run --bin balancesock -- --simulate --bypass-hmd

use balancesock::{
    args::SockArgs,
    clock::{CancelToken, Clock, SystemClock},
    config::SessionConfig,
    cop_board::CopBoard,
    dummy_sock::DummySocks,
    exercise::{Catalog, ExerciseEngine},
    frame_log,
    gui::TuiPortSelector,
    handshake::HandshakeServer,
    hmd::{FeedbackSink, LogOnlySink, TcpHmdLink, CONNECT_DELAY, CONNECT_RETRIES},
    registry::DeviceRegistry,
    session::{PortFileSelector, PortSelector, SessionController},
    transport::{Serial2Backend, SerialBackend},
};

use clap::Parser;
use log::{error, info, warn};
use std::{
    io::{self, BufRead},
    process,
    sync::Arc,
    thread::{self, JoinHandle},
};

const HELP: &str = "commands: connect | calibrate | start | stop | user <id> | help | exit";

struct Program {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

struct Console {
    session: SessionController,
    config: SessionConfig,
    catalog: Arc<Catalog>,
    clock: Arc<dyn Clock>,
    selector: Box<dyn PortSelector>,
    board: Arc<CopBoard>,
    shutdown: CancelToken,
    calibrated: bool,
    program: Option<Program>,
}

impl Console {
    fn handle(&mut self, line: &str) -> bool {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("connect") => {
                let devices = self
                    .session
                    .handle_connect_command(self.selector.as_ref(), &self.shutdown);
                info!("{} device(s) connected", devices.len());
            }
            Some("calibrate") => {
                let outcomes = self.session.handle_calibrate_command(&self.shutdown);
                self.calibrated = !outcomes.is_empty() && outcomes.iter().all(|(_, ok)| *ok);
                if self.calibrated {
                    info!("Calibration completed. Use 'start' to begin the exercises.");
                }
            }
            Some("start") => self.start_program(),
            Some("stop") => self.stop_program(),
            Some("user") => match words.next().map(str::parse::<u32>) {
                Some(Ok(user_id)) => {
                    match frame_log::create_user_log_files(&self.config.device.log_dir, user_id) {
                        Ok(paths) => info!("Logging to {:?}", paths),
                        Err(e) => error!("Could not create log files: {}", e),
                    }
                }
                _ => warn!("usage: user <id>"),
            },
            Some("help") => println!("{}", HELP),
            Some("exit") | Some("quit") => return false,
            Some(other) => warn!("Unknown command '{}'. {}", other, HELP),
            None => {}
        }
        true
    }

    fn start_program(&mut self) {
        if !self.calibrated {
            warn!("Calibrate before starting the exercises");
            return;
        }
        if self
            .program
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
        {
            info!("The exercise program is already running");
            return;
        }

        self.session.start_data_stream();
        self.board.attach(&self.session.connected_devices());

        let cancel = CancelToken::new();
        let engine = ExerciseEngine::new(
            self.catalog.clone(),
            self.board.clone(),
            self.clock.clone(),
            self.config.engine,
        );
        let clock = self.clock.clone();
        let hmd_addr = self.config.hmd_addr.clone();
        let bypass = self.config.bypass_hmd;
        let th_cancel = cancel.clone();
        let handle = thread::spawn(move || {
            let mut sink: Box<dyn FeedbackSink> = if bypass {
                Box::new(LogOnlySink)
            } else {
                match TcpHmdLink::connect(
                    hmd_addr.as_str(),
                    CONNECT_RETRIES,
                    CONNECT_DELAY,
                    clock.as_ref(),
                    &th_cancel,
                ) {
                    Ok(link) => Box::new(link),
                    Err(e) => {
                        error!("{}", e);
                        return;
                    }
                }
            };
            match engine.run_program(sink.as_mut(), &th_cancel) {
                Ok(outcomes) => {
                    let restarts: u32 = outcomes.iter().map(|o| o.restarts).sum();
                    info!(
                        "Program finished: {} runs, {} restarts",
                        outcomes.len(),
                        restarts
                    );
                }
                Err(_) => info!("Exercise program stopped"),
            }
        });
        self.program = Some(Program { cancel, handle });
    }

    fn stop_program(&mut self) {
        if let Some(program) = self.program.take() {
            program.cancel.cancel();
            if program.handle.join().is_err() {
                error!("Exercise program panicked");
            }
        }
        self.board.detach();
        self.session.stop_data_stream();
    }
}

fn main() {
    let args = SockArgs::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &args.config {
        Some(path) => SessionConfig::from_path(path).unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        }),
        None => SessionConfig::default(),
    };
    args.apply(&mut config);
    let catalog = config.load_catalog().unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend: Arc<dyn SerialBackend> = if args.simulate {
        Arc::new(DummySocks::new())
    } else {
        Arc::new(Serial2Backend)
    };
    let registry = Arc::new(DeviceRegistry::new(
        backend,
        clock.clone(),
        config.device.clone(),
    ));
    let session = SessionController::new(registry.clone());
    session.start();

    let _server = config.handshake_bind.as_deref().and_then(|addr| {
        HandshakeServer::bind(addr, registry.clone())
            .map_err(|e| error!("Could not start handshake server on {}: {}", addr, e))
            .ok()
    });

    let selector: Box<dyn PortSelector> = if args.tui_select {
        Box::new(TuiPortSelector)
    } else {
        info!(
            "Waiting for port selections in {}",
            config.selection_file.display()
        );
        Box::new(PortFileSelector::new(
            config.selection_file.clone(),
            config.selection_poll,
            clock.clone(),
        ))
    };

    let mut console = Console {
        session,
        config,
        catalog: Arc::new(catalog),
        clock,
        selector,
        board: Arc::new(CopBoard::new()),
        shutdown: CancelToken::new(),
        calibrated: false,
        program: None,
    };

    println!("{}", HELP);
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Could not read command: {}", e);
                break;
            }
        };
        if !console.handle(line.trim()) {
            break;
        }
    }

    console.shutdown.cancel();
    console.stop_program();
    console.session.stop();
}
