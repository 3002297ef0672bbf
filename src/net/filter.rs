/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::error::{Error, Result};

/// Textual filter specification, written once and compiled per backend.
#[derive(Debug, Clone)]
pub struct FilterSpec(String);

impl FilterSpec {
    pub fn new<S: AsRef<str>>(spec: S) -> Self {
        Self(spec.as_ref().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FilterSpec {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Protocol selection derived from a compiled expression. This is the only
/// part of a filter the in-process backend consumes; real backends take the
/// expression opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSelection {
    pub tcp: bool,
    pub udp: bool,
}

impl ProtocolSelection {
    pub const ALL: ProtocolSelection = ProtocolSelection {
        tcp: true,
        udp: true,
    };
}

/// Backend-agnostic compiled form of a filter. Consumers only read the
/// normalized expression back; they never interpret it here.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    expression: String,
    selection: ProtocolSelection,
}

impl CompiledFilter {
    pub fn to_expression(&self) -> &str {
        &self.expression
    }

    pub fn selection(&self) -> ProtocolSelection {
        self.selection
    }
}

pub trait FilterCompiler: Send + Sync {
    fn compile(&self, spec: &FilterSpec) -> Result<CompiledFilter>;
}

/// Builtin expression compiler: validates the token vocabulary, normalizes
/// whitespace and records the protocol selection. Stands in for the
/// pcap/rte_flow/NTPL compilers behind the backend seam.
#[derive(Debug, Default)]
pub struct ExprCompiler;

impl FilterCompiler for ExprCompiler {
    fn compile(&self, spec: &FilterSpec) -> Result<CompiledFilter> {
        let mut selection = ProtocolSelection {
            tcp: false,
            udp: false,
        };
        let mut normalized: Vec<&str> = vec![];
        for word in spec.as_str().split_whitespace() {
            match word {
                "tcp" => selection.tcp = true,
                "udp" => selection.udp = true,
                "ip" | "all" | "and" | "or" | "not" => (),
                w if w.chars().all(|c| c.is_ascii_digit()) => (),
                "port" => (),
                other => {
                    return Err(Error::FilterInvalid(format!(
                        "unknown filter token {:?} in {:?}",
                        other,
                        spec.as_str()
                    )))
                }
            }
            normalized.push(word);
        }
        if !selection.tcp && !selection.udp {
            // no protocol narrowing means everything passes
            selection = ProtocolSelection::ALL;
        }
        Ok(CompiledFilter {
            expression: normalized.join(" "),
            selection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_normalizes_whitespace() {
        let filter = ExprCompiler
            .compile(&FilterSpec::new("tcp  and   port 443"))
            .unwrap();
        assert_eq!(filter.to_expression(), "tcp and port 443");
        assert!(filter.selection().tcp);
        assert!(!filter.selection().udp);
    }

    #[test]
    fn unfiltered_spec_selects_everything() {
        let filter = ExprCompiler.compile(&FilterSpec::new("all")).unwrap();
        assert_eq!(filter.selection(), ProtocolSelection::ALL);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let err = ExprCompiler
            .compile(&FilterSpec::new("tcp && port 443"))
            .unwrap_err();
        assert!(matches!(err, Error::FilterInvalid(_)));
    }
}
