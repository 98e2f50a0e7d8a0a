// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use tracing::instrument;

/// Writes a throwaway authority plus server and client leaf certificates
/// into `output_dir`, ready to wire both hops together: the remote hop takes
/// `server.pem`/`server.key`, the local hop takes `client.pem`/`client.key`,
/// and both take `ca.pem`.
#[instrument]
pub async fn certgen_main(output_dir: String, host_san: String) -> Result<()> {
  use std::fs;
  use std::path::PathBuf;
  let dir = PathBuf::from(output_dir);
  fs::create_dir_all(&dir).context("Directory creation must succeed for certs")?;

  let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new());
  ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
  ca_params
    .distinguished_name
    .push(rcgen::DnType::CommonName, "tandem backhaul authority");
  let authority =
    rcgen::Certificate::from_params(ca_params).context("Authority generation failed")?;
  fs::write(
    dir.join("ca.pem"),
    authority.serialize_pem().context("Authority serialization failed")?,
  )
  .context("Failed writing authority certificate")?;
  fs::write(dir.join("ca.key"), authority.serialize_private_key_pem())
    .context("Failed writing authority key")?;

  for (name, san) in [("server", host_san.as_str()), ("client", "tandem-local")] {
    let params = rcgen::CertificateParams::new(vec![san.to_string()]);
    let cert = rcgen::Certificate::from_params(params)
      .with_context(|| format!("Certificate generation failed for {name}"))?;
    fs::write(
      dir.join(format!("{name}.pem")),
      cert
        .serialize_pem_with_signer(&authority)
        .with_context(|| format!("Signing failed for {name}"))?,
    )
    .with_context(|| format!("Failed writing {name} certificate"))?;
    fs::write(dir.join(format!("{name}.key")), cert.serialize_private_key_pem())
      .with_context(|| format!("Failed writing {name} key"))?;
  }

  tracing::info!(dir = ?dir, "backhaul certificates written");
  Ok(())
}
