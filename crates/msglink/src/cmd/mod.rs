use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod envinfo;
pub mod recv;
pub mod send;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message on a named channel.
    Send(SendArgs),
    /// Receive and print messages from a named channel.
    Recv(RecvArgs),
    /// Print build and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Recv(args) => recv::run(args, format),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Channel name; its address is looked up in the environment unless
    /// --address is given.
    pub name: String,
    /// Explicit backend address (queue name, host:port, or file path).
    #[arg(long)]
    pub address: Option<String>,
    /// Backend kind (queue, socket, file).
    #[arg(long, short = 't')]
    pub transport: Option<String>,
    /// Values as a JSON array.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// A single text value.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// A single bytes value read from a file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Type descriptor as JSON; inferred from the values when omitted.
    #[arg(long, value_name = "JSON")]
    pub datatype: Option<String>,
    /// Largest single frame before the body splits into parts.
    #[arg(long, value_name = "BYTES")]
    pub max_frame: Option<usize>,
    /// Send the end-of-channel sentinel after the payload.
    #[arg(long)]
    pub eof: bool,
}

#[derive(Args, Debug)]
pub struct RecvArgs {
    /// Channel name; its address is looked up in the environment unless
    /// --address is given.
    pub name: String,
    /// Explicit backend address (queue name, host:port, or file path).
    #[arg(long)]
    pub address: Option<String>,
    /// Backend kind (queue, socket, file).
    #[arg(long, short = 't')]
    pub transport: Option<String>,
    /// Exit after receiving N messages instead of waiting for end-of-channel.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}
