//! Admin command-line interface

pub mod commands;
