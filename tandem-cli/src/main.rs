// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{collections::HashSet, net::IpAddr, path::PathBuf, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use tandem::config::TlsPaths;
use tandem::util::validators::{
  parse_host_port, parse_socketaddr, validate_existing_file, validate_host_port,
  validate_socketaddr,
};

mod certgen;
mod local;
mod remote;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");

  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("local")
        .alias("-l")
        .about("Run the client-facing hop, relaying everything over the backhaul")
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:8080")
            .takes_value(true),
        )
        .arg(
          Arg::new("backhaul")
            .help("Remote hop address as host:port")
            .long("backhaul")
            .short('r')
            .validator(validate_host_port)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("backhaul-san")
            .help("Name the remote hop certificate is validated against")
            .long("backhaul-san")
            .visible_alias("san")
            .short('s')
            .takes_value(true)
            .required(false),
        )
        .arg(tls_off_arg())
        .arg(cert_arg())
        .arg(key_arg())
        .arg(ca_arg())
        .arg(timeout_arg("180"))
        .arg(buffer_arg())
        .arg(
          Arg::new("allow")
            .help("Source address permitted to use this hop; repeatable")
            .long("allow")
            .short('a')
            .validator(validate_ipaddr)
            .multiple_occurrences(true)
            .default_value("127.0.0.1")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("remote")
        .alias("-r")
        .about("Run the destination-facing hop, terminating the backhaul")
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("0.0.0.0:50000")
            .takes_value(true),
        )
        .arg(tls_off_arg())
        .arg(cert_arg())
        .arg(key_arg())
        .arg(ca_arg())
        .arg(timeout_arg("60"))
        .arg(buffer_arg())
        .arg(
          Arg::new("allow")
            .help("Source address permitted to use this hop; repeatable. Omit to allow all")
            .long("allow")
            .short('a')
            .validator(validate_ipaddr)
            .multiple_occurrences(true)
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate an authority plus server and client certificates for the backhaul")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn tls_off_arg() -> Arg<'static> {
  Arg::new("ssl-off")
    .help("Disable backhaul encryption entirely")
    .long("ssl-off")
    .takes_value(false)
}

fn cert_arg() -> Arg<'static> {
  Arg::new("cert")
    .long("cert")
    .short('c')
    .validator(validate_existing_file)
    .takes_value(true)
    .required_unless_present("ssl-off")
}

fn key_arg() -> Arg<'static> {
  Arg::new("key")
    .long("key")
    .short('k')
    .validator(validate_existing_file)
    .takes_value(true)
    .required_unless_present("ssl-off")
}

fn ca_arg() -> Arg<'static> {
  Arg::new("ca")
    .long("ca")
    .validator(validate_existing_file)
    .takes_value(true)
    .required_unless_present("ssl-off")
}

fn timeout_arg(default: &'static str) -> Arg<'static> {
  Arg::new("timeout")
    .help("Idle timeout in seconds before a quiet session is closed")
    .long("timeout")
    .short('t')
    .validator(validate_u64)
    .default_value(default)
    .takes_value(true)
}

fn buffer_arg() -> Arg<'static> {
  Arg::new("buffer")
    .help("Relay copy chunk size in bytes")
    .long("buffer")
    .validator(validate_u64)
    .default_value("8192")
    .takes_value(true)
}

fn validate_ipaddr(v: &str) -> Result<(), String> {
  v.parse::<IpAddr>().map(|_| ()).map_err(|e| e.to_string())
}

fn validate_u64(v: &str) -> Result<(), String> {
  v.parse::<u64>().map(|_| ()).map_err(|e| e.to_string())
}

fn tls_paths(args: &ArgMatches) -> Option<TlsPaths> {
  if args.is_present("ssl-off") {
    return None;
  }
  // cert/key/ca are required by clap unless ssl-off is present.
  Some(TlsPaths {
    cert: PathBuf::from(args.value_of("cert").unwrap_or_default()),
    key: PathBuf::from(args.value_of("key").unwrap_or_default()),
    ca: PathBuf::from(args.value_of("ca").unwrap_or_default()),
  })
}

fn allow_set(args: &ArgMatches) -> Result<HashSet<IpAddr>> {
  args
    .values_of("allow")
    .map(|values| {
      values
        .map(|v| v.parse::<IpAddr>().context("Invalid allow address"))
        .collect()
    })
    .unwrap_or_else(|| Ok(HashSet::new()))
}

pub fn local_arg_handling(args: &'_ ArgMatches) -> Result<local::LocalArgs> {
  let (backhaul_host, backhaul_port) = parse_host_port(
    args
      .value_of("backhaul")
      .context("Backhaul argument is required")?,
  )?;
  Ok(local::LocalArgs {
    bind: parse_socketaddr(args.value_of("bind").unwrap_or_default())?,
    backhaul_host,
    backhaul_port,
    backhaul_san: args.value_of("backhaul-san").map(String::from),
    tls: tls_paths(args),
    timeout: Duration::from_secs(args.value_of_t("timeout")?),
    buffer_size: args.value_of_t("buffer")?,
    allow: allow_set(args)?,
  })
}

pub fn remote_arg_handling(args: &'_ ArgMatches) -> Result<remote::RemoteArgs> {
  Ok(remote::RemoteArgs {
    bind: parse_socketaddr(args.value_of("bind").unwrap_or_default())?,
    tls: tls_paths(args),
    timeout: Duration::from_secs(args.value_of_t("timeout")?),
    buffer_size: args.value_of_t("buffer")?,
    allow: allow_set(args)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("local", opts) => {
      let config = local_arg_handling(opts)?;
      tracing::info!("Running as local hop with config {:#?}", config);
      local::local_main(config).await
    }
    ("remote", opts) => {
      let config = remote_arg_handling(opts)?;
      tracing::info!("Running as remote hop with config {:#?}", config);
      remote::remote_main(config).await
    }
    ("cert", opts) => {
      tracing::info!("Generating certs...");
      let path_raw = opts.value_of("path").expect("Path argument is required");
      let san = opts.value_of("san").expect("SAN argument must exist");
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    (_, _) => unreachable!(),
  }
}
