use msglink_comm::{CommConfig, CommRecv, Communicator, Direction};
use msglink_transport::TransportKind;

use crate::cmd::RecvArgs;
use crate::exit::{comm_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_values, OutputFormat};

pub fn run(args: RecvArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = CommConfig::default();
    if let Some(kind) = &args.transport {
        let kind: TransportKind = kind
            .parse()
            .map_err(|_| CliError::new(USAGE, format!("unknown transport: {kind}")))?;
        config = config.with_kind(kind);
    }

    let mut comm = match &args.address {
        Some(address) => Communicator::open_at(&args.name, Direction::Recv, address, config),
        None => Communicator::from_env_with(&args.name, Direction::Recv, config),
    }
    .map_err(|err| comm_error("open failed", err))?;

    let mut sequence = 0usize;
    loop {
        if let Some(count) = args.count {
            if sequence >= count {
                break;
            }
        }
        match comm.recv().map_err(|err| comm_error("receive failed", err))? {
            CommRecv::Values(values) => {
                print_values(&args.name, sequence, &values, format);
                sequence += 1;
            }
            CommRecv::Eof => break,
        }
    }

    comm.close().map_err(|err| comm_error("close failed", err))?;
    Ok(SUCCESS)
}
