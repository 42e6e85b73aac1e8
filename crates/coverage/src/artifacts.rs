//! Compiled-artifact access.
//!
//! The host build tool is only consumed through [`ArtifactsSource`]: a list
//! of fully-qualified contract names plus, per name, the solc build info
//! that produced it. [`DiskArtifacts`] reads hardhat-style
//! `build-info/*.json` files from an artifacts directory.

use crate::ast::AstNode;
use eyre::{Context, Result};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A solc build-info file: compiler input and output for one compilation.
#[derive(Clone, Debug, Deserialize)]
pub struct BuildInfo {
    pub input: CompilerInput,
    pub output: CompilerOutput,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CompilerInput {
    #[serde(default)]
    pub sources: BTreeMap<String, InputSource>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InputSource {
    pub content: Arc<str>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CompilerOutput {
    #[serde(default)]
    pub sources: BTreeMap<String, OutputSource>,
    /// `path -> contract name -> contract`.
    #[serde(default)]
    pub contracts: BTreeMap<String, BTreeMap<String, Contract>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutputSource {
    pub id: u32,
    pub ast: Arc<AstNode>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Contract {
    pub evm: Evm,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evm {
    /// Constructor (creation) code.
    #[serde(default)]
    pub bytecode: CompilerOutputCode,
    /// Runtime code.
    #[serde(default)]
    pub deployed_bytecode: CompilerOutputCode,
}

/// One bytecode object with its source map and the compiler-generated
/// sources its map references.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerOutputCode {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub source_map: String,
    #[serde(default)]
    pub generated_sources: Vec<GeneratedSource>,
}

/// A synthetic source emitted by the compiler (ABI coders and the like),
/// conventionally named with a leading `#`.
#[derive(Clone, Debug, Deserialize)]
pub struct GeneratedSource {
    pub id: u32,
    pub name: String,
    pub contents: Arc<str>,
    pub ast: Arc<AstNode>,
}

/// Where compiled artifacts come from.
pub trait ArtifactsSource {
    /// Every `<path>:<contract>` name known to the build.
    fn fully_qualified_names(&self) -> Result<Vec<String>>;

    /// The build info that compiled `fqn`.
    fn build_info(&self, fqn: &str) -> Result<Arc<BuildInfo>>;
}

/// Reads hardhat-style artifacts from disk: every `build-info/*.json` under
/// the artifacts directory.
#[derive(Debug)]
pub struct DiskArtifacts {
    builds: Vec<Arc<BuildInfo>>,
}

impl DiskArtifacts {
    /// Loads every build-info file under `artifacts_dir`.
    pub fn load(artifacts_dir: &Path) -> Result<Self> {
        let build_info_dir = artifacts_dir.join("build-info");
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&build_info_dir)
            .wrap_err_with(|| format!("could not read {}", build_info_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut builds = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("could not read {}", path.display()))?;
            let info: BuildInfo = serde_json::from_str(&raw)
                .wrap_err_with(|| format!("malformed build info {}", path.display()))?;
            debug!(path = %path.display(), contracts = info.output.contracts.len(), "loaded build info");
            builds.push(Arc::new(info));
        }
        Ok(Self { builds })
    }
}

impl ArtifactsSource for DiskArtifacts {
    fn fully_qualified_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for info in &self.builds {
            for (path, contracts) in &info.output.contracts {
                for name in contracts.keys() {
                    names.push(format!("{path}:{name}"));
                }
            }
        }
        Ok(names)
    }

    fn build_info(&self, fqn: &str) -> Result<Arc<BuildInfo>> {
        let (path, name) = split_fqn(fqn)?;
        self.builds
            .iter()
            .find(|info| {
                info.output.contracts.get(path).is_some_and(|c| c.contains_key(name))
            })
            .cloned()
            .ok_or_else(|| eyre::eyre!("no build info for {fqn}"))
    }
}

/// Splits `<path>:<contract>` on the last `:`, so drive-letter-free paths
/// containing colons still resolve.
pub fn split_fqn(fqn: &str) -> Result<(&str, &str)> {
    fqn.rsplit_once(':')
        .ok_or_else(|| eyre::eyre!("malformed fully qualified name: {fqn}"))
}
