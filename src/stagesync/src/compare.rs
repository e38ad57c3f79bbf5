// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Read-only comparison of production's configuration with the clone's.

use std::collections::BTreeMap;
use std::fmt::Write;

use itertools::{EitherOrBoth, Itertools};

use crate::tuning::{self, TuningParameter};

/// How one key differs between the two hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    OnlyProduction(String),
    OnlyLocal(String),
    Differs { production: String, local: String },
}

/// Differences keyed by tuning-parameter key or setting name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub parameters: BTreeMap<String, Difference>,
    pub settings: BTreeMap<String, Difference>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.settings.is_empty()
    }
}

fn mask(key: &str, value: String) -> String {
    if tuning::is_secret_key(key) {
        tuning::SECRET_MASK.to_string()
    } else {
        value
    }
}

fn diff_maps(
    production: &BTreeMap<String, String>,
    local: &BTreeMap<String, String>,
) -> BTreeMap<String, Difference> {
    production
        .iter()
        .merge_join_by(local.iter(), |(a, _), (b, _)| a.cmp(b))
        .filter_map(|pair| {
            let (key, difference) = match pair {
                EitherOrBoth::Left((key, value)) => {
                    (key, Difference::OnlyProduction(mask(key, value.clone())))
                }
                EitherOrBoth::Right((key, value)) => {
                    (key, Difference::OnlyLocal(mask(key, value.clone())))
                }
                EitherOrBoth::Both((key, production), (_, local)) => {
                    if production == local {
                        return None;
                    }
                    (
                        key,
                        Difference::Differs {
                            production: mask(key, production.clone()),
                            local: mask(key, local.clone()),
                        },
                    )
                }
            };
            Some((key.clone(), difference))
        })
        .collect()
}

/// Keys to their options; a key bound more than once shows every option.
fn by_key(parameters: &[TuningParameter]) -> BTreeMap<String, String> {
    parameters
        .iter()
        .into_group_map_by(|p| p.key())
        .into_iter()
        .map(|(key, options)| {
            let mut options: Vec<_> = options.into_iter().map(|p| p.option()).collect();
            options.sort();
            (key, options.join(" "))
        })
        .collect()
}

pub fn compare(
    production_parameters: &[TuningParameter],
    local_parameters: &[TuningParameter],
    production_settings: &BTreeMap<String, String>,
    local_settings: &BTreeMap<String, String>,
) -> ConfigDiff {
    ConfigDiff {
        parameters: diff_maps(&by_key(production_parameters), &by_key(local_parameters)),
        settings: diff_maps(production_settings, local_settings),
    }
}

fn write_section(out: &mut String, title: &str, differences: &BTreeMap<String, Difference>) {
    let _ = writeln!(out, "{title}:");
    if differences.is_empty() {
        let _ = writeln!(out, "  identical");
        return;
    }
    for (key, difference) in differences {
        match difference {
            Difference::OnlyProduction(value) => {
                let _ = writeln!(out, "  only in production: {key} = {value}");
            }
            Difference::OnlyLocal(value) => {
                let _ = writeln!(out, "  only locally:       {key} = {value}");
            }
            Difference::Differs { production, local } => {
                let _ = writeln!(out, "  differs:            {key}");
                let _ = writeln!(out, "    production: {production}");
                let _ = writeln!(out, "    local:      {local}");
            }
        }
    }
}

pub fn render(diff: &ConfigDiff) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== configuration comparison ===");
    write_section(&mut out, "\nTuning parameters", &diff.parameters);
    write_section(&mut out, "\nSettings", &diff.settings);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(options: &[&str]) -> Vec<TuningParameter> {
        options
            .iter()
            .map(|o| TuningParameter::parse(o).unwrap())
            .collect()
    }

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn classifies_differences() {
        let diff = compare(
            &params(&["-Xmx8g", "-Ddataverse.fqdn=dataverse.example.org", "-server"]),
            &params(&["-Xmx4g", "-Ddataverse.fqdn=staging.example.org", "-Dlocal.only=1"]),
            &settings(&[(":SiteName", "Production"), (":Shared", "x")]),
            &settings(&[(":SiteName", "Staging"), (":Shared", "x"), (":Extra", "y")]),
        );
        assert_eq!(
            diff.parameters["-Xmx"],
            Difference::Differs {
                production: "-Xmx8g".into(),
                local: "-Xmx4g".into()
            }
        );
        assert_eq!(
            diff.parameters["-server"],
            Difference::OnlyProduction("-server".into())
        );
        assert_eq!(
            diff.parameters["local.only"],
            Difference::OnlyLocal("-Dlocal.only=1".into())
        );
        assert!(!diff.settings.contains_key(":Shared"));
        assert_eq!(diff.settings[":Extra"], Difference::OnlyLocal("y".into()));
        assert_eq!(diff.settings.len(), 2);
    }

    #[test]
    fn masks_secrets() {
        let diff = compare(
            &params(&["-Ddataverse.db.password=hunter2"]),
            &[],
            &settings(&[(":ApiToken", "abc")]),
            &settings(&[(":ApiToken", "def")]),
        );
        let rendered = render(&diff);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("abc"));
        assert!(!rendered.contains("def"));
        assert!(rendered.contains(tuning::SECRET_MASK));
    }

    #[test]
    fn identical_configurations_render_as_such() {
        let diff = compare(&params(&["-Xmx4g"]), &params(&["-Xmx4g"]), &settings(&[]), &settings(&[]));
        assert!(diff.is_empty());
        assert!(render(&diff).contains("identical"));
    }
}
