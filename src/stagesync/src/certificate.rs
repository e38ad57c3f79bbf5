// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! TLS certificate expiry check.

use std::cmp::Ordering;
use std::path::Path;

use anyhow::Context;
use openssl::asn1::Asn1Time;
use openssl::x509::X509;

/// Certificates expiring within this many days are reported.
pub const EXPIRY_WARNING_DAYS: u32 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    Valid { days_left: i32 },
    ExpiresSoon { days_left: i32 },
    Expired,
}

impl Expiry {
    /// The warning to record, if any.
    pub fn warning(&self, path: &Path) -> Option<String> {
        match self {
            Expiry::Valid { .. } => None,
            Expiry::ExpiresSoon { days_left } => Some(format!(
                "TLS certificate {} expires in {days_left} day(s)",
                path.display()
            )),
            Expiry::Expired => Some(format!("TLS certificate {} has expired", path.display())),
        }
    }
}

/// Checks the first certificate in the PEM file at `path`.
pub fn check(path: &Path) -> anyhow::Result<Expiry> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let cert = X509::from_pem(&pem).with_context(|| format!("parsing {}", path.display()))?;
    let not_after = cert.not_after();
    let now = Asn1Time::days_from_now(0)?;
    if not_after.compare(&now)? != Ordering::Greater {
        return Ok(Expiry::Expired);
    }
    let days_left = now.diff(not_after)?.days;
    let horizon = Asn1Time::days_from_now(EXPIRY_WARNING_DAYS)?;
    if not_after.compare(&horizon)? == Ordering::Greater {
        Ok(Expiry::Valid { days_left })
    } else {
        Ok(Expiry::ExpiresSoon { days_left })
    }
}
