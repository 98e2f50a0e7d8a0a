// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  collections::HashSet,
  net::{IpAddr, SocketAddr},
  time::Duration,
};

use anyhow::Result;
use tandem::config::{RemoteConfig, TlsPaths};
use tokio_util::sync::CancellationToken;

/// Parameters used to run the destination-facing hop.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RemoteArgs {
  pub bind: SocketAddr,
  pub tls: Option<TlsPaths>,
  pub timeout: Duration,
  pub buffer_size: usize,
  pub allow: HashSet<IpAddr>,
}

pub async fn remote_main(args: RemoteArgs) -> Result<()> {
  let config = RemoteConfig {
    bind: args.bind,
    tls: args.tls,
    idle_timeout: args.timeout,
    tick: tandem::config::DEFAULT_TICK,
    buffer_size: args.buffer_size,
    permitted: args.allow,
  };

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  tandem::remote::run(config, shutdown).await?;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  Ok(())
}
