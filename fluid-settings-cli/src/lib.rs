//! Helpers for the fluid-settings command-line tool.

pub mod display;
