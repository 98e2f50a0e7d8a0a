// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Source-address admission control, checked before any relay resources are
//! committed to a connection.

use std::{collections::HashSet, net::IpAddr};

/// Whether a peer at `source` may use the proxy.
///
/// An empty set is the allow-all policy; a non-empty set requires an exact
/// address match, with no CIDR or subnet interpretation.
pub fn permitted(source: IpAddr, permitted_set: &HashSet<IpAddr>) -> bool {
  permitted_set.is_empty() || permitted_set.contains(&source)
}
