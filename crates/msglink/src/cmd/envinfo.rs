use std::collections::BTreeMap;

use serde::Serialize;

use crate::cmd::EnvinfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct PlatformInfo {
    os: String,
    arch: String,
}

#[derive(Serialize)]
struct EnvInfoOutput {
    schema_id: &'static str,
    version: String,
    platform: PlatformInfo,
    default_transport: String,
    rpc_transport: Option<String>,
    channels: BTreeMap<String, String>,
    environment: BTreeMap<String, Option<String>>,
}

pub fn run(_args: EnvinfoArgs, format: OutputFormat) -> CliResult<i32> {
    let mut env = BTreeMap::new();
    for key in [
        "MSGLINK_DEFAULT_TRANSPORT",
        "MSGLINK_RPC_TRANSPORT",
        "MSGLINK_MODEL_NAME",
        "MSGLINK_PORT_BASE",
        "RUST_LOG",
    ] {
        env.insert(key.to_string(), std::env::var(key).ok());
    }

    // Any published channel address is visible as a *_IN / *_OUT variable.
    let channels: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.ends_with("_IN") || key.ends_with("_OUT"))
        .collect();

    let output = EnvInfoOutput {
        schema_id: "https://msglink.dev/schemas/cli/v1/envinfo.schema.json",
        version: env!("CARGO_PKG_VERSION").to_string(),
        platform: PlatformInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        default_transport: format!("{:?}", msglink_transport::default_kind()).to_lowercase(),
        rpc_transport: msglink_transport::rpc_kind_override()
            .map(|kind| format!("{kind:?}").to_lowercase()),
        channels,
        environment: env,
    };

    print_envinfo(&output, format);
    Ok(SUCCESS)
}

fn print_envinfo(output: &EnvInfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("msglink environment\n");
            println!("  Version:            {}", output.version);
            println!(
                "  Platform:           {} ({})",
                output.platform.os, output.platform.arch
            );
            println!("  Default transport:  {}", output.default_transport);
            println!(
                "  RPC transport:      {}",
                output.rpc_transport.as_deref().unwrap_or("(default)")
            );
            if !output.channels.is_empty() {
                println!("\n  Channels:");
                for (k, v) in &output.channels {
                    println!("    {:<26} {}", k, v);
                }
            }
            println!("\n  Environment:");
            for (k, v) in &output.environment {
                println!("    {:<26} {}", k, v.as_deref().unwrap_or("(not set)"));
            }
        }
        OutputFormat::Raw => println!("{}", output.version),
    }
}
