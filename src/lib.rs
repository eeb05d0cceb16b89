//! BalanceSock is the host side of a balance-training biofeedback system.
//! Pressure-sensing insoles ("socks") stream binary frames over serial
//! links; this crate decodes them into a center of pressure (CoP) per foot,
//! logs every frame, and runs a phase-based exercise program that
//! classifies the CoP into feedback zones, restarts an exercise when the
//! wearer loses balance, and reports to a head-mounted display (HMD).
//!
//! The pipeline, from the wire up:
//!
//! - [`packet`] and [`sensor_link`] find, validate and decode frames.
//! - [`device`] owns one sock's serial link, streaming state and frame log
//!   ([`frame_log`]), and publishes events through an [`event_hub`].
//! - [`registry`] discovers ports; [`session`] drives connect, calibrate
//!   and streaming for the operator; [`handshake`] lets a remote peer
//!   negotiate which socks it observes.
//! - [`cop_board`] keeps the latest CoP per foot for the [`exercise`]
//!   engine, which talks to the HMD through [`hmd`].

pub mod args;
pub mod clock;
pub mod config;
pub mod cop_board;
pub mod device;
pub mod dummy_sock;
pub mod event_hub;
pub mod exercise;
pub mod frame_log;
pub mod gui;
pub mod handshake;
pub mod hmd;
pub mod packet;
pub mod registry;
pub mod sensor_link;
pub mod session;
pub mod transport;
