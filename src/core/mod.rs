//! Core module containing the test execution engine
//!
//! This module provides:
//! - Test model and pending result scaffold
//! - Deployment image collection and blob packing
//! - Device discovery and session preparation
//! - Deployment with retry and completion detection
//! - Local emulator process management
//! - Target output parsing with setup skip propagation
//! - Run orchestration
//! - Host diagnostics and result sinks
//! - A scriptable device simulator

pub mod deploy;
pub mod device;
pub mod discovery;
pub mod emulator;
pub mod image;
pub mod logger;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod serial;
pub mod simulator;
pub mod sink;
