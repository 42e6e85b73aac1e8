//! The registry tying bytecodes, deployed addresses and compiler sources
//! together.
//!
//! Deployed bytecode rarely equals compiled bytecode byte-for-byte:
//! immutable slots are patched in at deploy time and the metadata tail may
//! differ. [`Sources::bytecode_to_source_map`] resolves those cases with a
//! fuzzy match and caches the result under the new key.

use crate::{
    artifacts::{split_fqn, ArtifactsSource, CompilerOutputCode},
    ast::CompilerSource,
    normalize_hex,
    sourcemap::SourceMap,
    CoverageError,
};
use alloy_primitives::Address;
use eyre::{Context, Result};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// Shortest bytecode eligible for the prefix rule; anything at or below
/// this is a stub that would match almost everything.
const MIN_PREFIX_MATCH_LEN: usize = 42;

#[derive(Debug, Default)]
pub struct Sources {
    address_to_bytecode: HashMap<Address, String>,
    bytecode_to_source_map: HashMap<String, Arc<SourceMap>>,
    /// `(bytecode, compiler source id) -> disambiguated path`.
    bytecode_to_source_paths: HashMap<String, BTreeMap<u32, String>>,
    path_to_source: HashMap<String, CompilerSource>,
    /// Next suffix for `path:<k>` disambiguation.
    unique: usize,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every contract exposed by `artifacts`: parses the creation
    /// and runtime source maps and registers their compiler sources.
    pub fn crawl(&mut self, artifacts: &dyn ArtifactsSource) -> Result<()> {
        for fqn in artifacts.fully_qualified_names()? {
            let info = artifacts.build_info(&fqn)?;
            let (path, name) = split_fqn(&fqn)?;
            let Some(contract) = info.output.contracts.get(path).and_then(|c| c.get(name))
            else {
                warn!(%fqn, "contract missing from its own build info");
                continue;
            };

            let mut base = BTreeMap::new();
            for (source_path, output) in &info.output.sources {
                let Some(input) = info.input.sources.get(source_path) else {
                    warn!(path = %source_path, "compiler output references unknown input source");
                    continue;
                };
                base.insert(
                    output.id,
                    CompilerSource {
                        path: source_path.clone(),
                        content: input.content.clone(),
                        ast: output.ast.clone(),
                        id: output.id,
                    },
                );
            }

            let codes = [
                (fqn.clone(), &contract.evm.deployed_bytecode),
                (format!("{fqn} (creation)"), &contract.evm.bytecode),
            ];
            for (label, code) in codes {
                self.index_output_code(label, code, &base)
                    .wrap_err_with(|| format!("while indexing {fqn}"))?;
            }
        }
        Ok(())
    }

    fn index_output_code(
        &mut self,
        fqdn: String,
        code: &CompilerOutputCode,
        base: &BTreeMap<u32, CompilerSource>,
    ) -> Result<()> {
        let object = normalize_hex(&code.object);
        if object.is_empty() {
            debug!(%fqdn, "skipping contract without bytecode");
            return Ok(());
        }
        if object.bytes().any(|b| !b.is_ascii_hexdigit()) {
            // Unlinked library placeholders (`__$..$__`) land here.
            warn!(%fqdn, "skipping unlinked or non-hex bytecode");
            return Ok(());
        }

        let mut compiler_sources = base.clone();
        for generated in &code.generated_sources {
            compiler_sources.insert(
                generated.id,
                CompilerSource {
                    path: generated.name.clone(),
                    content: generated.contents.clone(),
                    ast: generated.ast.clone(),
                    id: generated.id,
                },
            );
        }

        let map = SourceMap::parse(fqdn, &object, &code.source_map, compiler_sources)?;
        self.index_source_map(Arc::new(map));
        Ok(())
    }

    /// Registers a parsed source map under its own bytecode and interns its
    /// compiler sources.
    pub fn index_source_map(&mut self, map: Arc<SourceMap>) {
        let bytecode = map.bytecode.clone();
        self.index_paths(&bytecode, &map);
        self.bytecode_to_source_map.insert(bytecode, map);
    }

    /// Interns each compiler source of `map` and binds `(bytecode, id)` to
    /// the resulting (possibly disambiguated) path.
    fn index_paths(&mut self, bytecode: &str, map: &SourceMap) {
        for (&id, source) in &map.compiler_sources {
            let path = self.intern_source(source);
            self.bytecode_to_source_paths
                .entry(bytecode.to_string())
                .or_default()
                .insert(id, path);
        }
    }

    /// Stores `source` under its nominal path, or a `path:<k>` alias when a
    /// different content already owns the nominal path.
    fn intern_source(&mut self, source: &CompilerSource) -> String {
        match self.path_to_source.get(&source.path) {
            None => {
                self.path_to_source.insert(source.path.clone(), source.clone());
                source.path.clone()
            }
            Some(existing) if existing.content == source.content => source.path.clone(),
            Some(_) => {
                for k in 0..self.unique {
                    let candidate = format!("{}:{k}", source.path);
                    // Suffix indices are shared across all paths, so most
                    // candidates do not exist.
                    match self.path_to_source.get(&candidate) {
                        Some(stored) if stored.content == source.content => return candidate,
                        _ => {}
                    }
                }
                let fresh = format!("{}:{}", source.path, self.unique);
                self.unique += 1;
                self.path_to_source.insert(fresh.clone(), source.clone());
                fresh
            }
        }
    }

    /// Merges deployed-address bindings. Bytecodes are normalized to
    /// lowercase unprefixed hex.
    pub fn load_addresses(&mut self, addresses: impl IntoIterator<Item = (Address, String)>) {
        for (address, bytecode) in addresses {
            self.address_to_bytecode.insert(address, normalize_hex(&bytecode));
        }
    }

    /// The bytecode deployed at `address`, if it was observed by a trace.
    pub fn address_to_bytecode(&self, address: Address) -> Result<&str, CoverageError> {
        self.address_to_bytecode
            .get(&address)
            .map(String::as_str)
            .ok_or(CoverageError::UnknownAddress(address))
    }

    /// Resolves a bytecode to its source map.
    ///
    /// Exact matches win. Otherwise two fuzzy rules apply against every
    /// known bytecode `k`:
    ///
    /// - same length: every hex position must agree or be `'0'` in `k`
    ///   (immutable slots are zeroed in compiled artifacts);
    /// - longer than `k` with `len(k) > 42`: `k` must be a prefix (metadata
    ///   tails differ).
    ///
    /// Fuzzy hits are cached under the queried key, so repeat lookups are
    /// exact.
    pub fn bytecode_to_source_map(
        &mut self,
        bytecode: &str,
    ) -> Result<Arc<SourceMap>, CoverageError> {
        if let Some(map) = self.bytecode_to_source_map.get(bytecode) {
            return Ok(map.clone());
        }

        let mut resolved = None;
        for (known, map) in &self.bytecode_to_source_map {
            let matches = if known.len() == bytecode.len() {
                bytecode.bytes().zip(known.bytes()).all(|(b, k)| b == k || k == b'0')
            } else {
                bytecode.len() > known.len()
                    && known.len() > MIN_PREFIX_MATCH_LEN
                    && bytecode.starts_with(known.as_str())
            };
            if matches {
                resolved = Some(map.clone());
                break;
            }
        }

        let map = resolved.ok_or_else(|| CoverageError::NoSourceMap(bytecode.to_string()))?;
        trace!(fqdn = %map.fqdn, "fuzzy-matched deployed bytecode");
        self.index_paths(bytecode, &map);
        self.bytecode_to_source_map.insert(bytecode.to_string(), map.clone());
        Ok(map)
    }

    /// The disambiguated path bound to `(bytecode, index)`.
    pub fn compiler_source_path(
        &self,
        bytecode: &str,
        index: i32,
    ) -> Result<&str, CoverageError> {
        u32::try_from(index)
            .ok()
            .and_then(|id| self.bytecode_to_source_paths.get(bytecode)?.get(&id))
            .map(String::as_str)
            .ok_or_else(|| CoverageError::NoPathForSource { bytecode: bytecode.to_string(), index })
    }

    /// Every interned source, keyed by its disambiguated path.
    pub fn compiler_sources(&self) -> impl Iterator<Item = (&String, &CompilerSource)> {
        self.path_to_source.iter()
    }
}
