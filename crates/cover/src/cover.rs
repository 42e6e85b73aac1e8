//! The `cover` task: compile, run the tests behind the proxy, write the
//! report.

use crate::proxy;
use clap::{Parser, ValueHint};
use eyre::{Context, Result};
use solcov_coverage::{
    artifacts::DiskArtifacts, Coverage, CoverInterceptor, HttpProvider, Report, RpcProvider,
    Sources, TraceReporter,
};
use std::{path::PathBuf, process::ExitStatus, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;

/// CLI arguments for `solcov cover`.
#[derive(Clone, Debug, Parser)]
pub struct CoverArgs {
    /// The path to write the JSON coverage report to, relative to the root.
    #[arg(
        long,
        value_hint = ValueHint::FilePath,
        value_name = "PATH",
        default_value = "coverage.json"
    )]
    coverage_file: PathBuf,

    /// Do not run the compile command first.
    #[arg(long)]
    no_compile: bool,

    /// Test files forwarded to the test command.
    #[arg(value_name = "TEST_FILES", value_hint = ValueHint::FilePath)]
    test_files: Vec<PathBuf>,

    /// The project root.
    #[arg(long, value_hint = ValueHint::DirPath, default_value = ".")]
    root: PathBuf,

    /// The artifacts directory, relative to the root.
    #[arg(long, value_hint = ValueHint::DirPath, default_value = "artifacts")]
    artifacts: PathBuf,

    /// The JSON-RPC endpoint of the node the tests run against.
    #[arg(
        long,
        env = "ETH_RPC_URL",
        value_name = "URL",
        default_value = "http://127.0.0.1:8545"
    )]
    rpc_url: url::Url,

    /// The local port for the intercepting proxy (0 picks a free one).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// The command that compiles the project.
    #[arg(long, value_name = "COMMAND", default_value = "npx hardhat compile")]
    compile_command: String,

    /// The command that runs the test suite. It receives the proxy URL via
    /// `ETH_RPC_URL`.
    #[arg(long, value_name = "COMMAND", default_value = "npx hardhat test")]
    test_command: String,
}

impl CoverArgs {
    pub async fn run(self) -> Result<()> {
        if !self.no_compile {
            info!(command = %self.compile_command, "compiling project");
            let status = self.exec(&self.compile_command, &[], None).await?;
            eyre::ensure!(status.success(), "compile command failed with {status}");
        }

        info!("indexing artifacts");
        let artifacts = DiskArtifacts::load(&self.root.join(&self.artifacts))?;
        let mut sources = Sources::new();
        sources.crawl(&artifacts)?;
        let coverage = Coverage::new(sources);

        let upstream: Arc<dyn RpcProvider> =
            Arc::new(HttpProvider::new(self.rpc_url.clone()));
        let reporter = Arc::new(Mutex::new(TraceReporter::new(upstream.clone(), coverage)));
        let interceptor = Arc::new(CoverInterceptor::new(upstream, reporter.clone()));

        let (addr, server) = proxy::serve(interceptor, self.port).await?;
        info!(%addr, "intercepting provider listening");

        let test_files: Vec<String> =
            self.test_files.iter().map(|path| path.display().to_string()).collect();
        let status =
            self.exec(&self.test_command, &test_files, Some(format!("http://{addr}"))).await?;
        server.abort();

        let report = reporter.lock().await.filtered_report();
        let path = self.root.join(&self.coverage_file);
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .wrap_err_with(|| format!("could not write {}", path.display()))?;
        println!("Wrote coverage report to {}.", path.display());
        print_summary(&report);

        eyre::ensure!(status.success(), "test command failed with {status}");
        Ok(())
    }

    async fn exec(
        &self,
        command: &str,
        extra_args: &[String],
        rpc_url: Option<String>,
    ) -> Result<ExitStatus> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| eyre::eyre!("empty command"))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts).args(extra_args).current_dir(&self.root);
        if let Some(url) = rpc_url {
            cmd.env("ETH_RPC_URL", url);
        }
        cmd.status().await.wrap_err_with(|| format!("could not run `{command}`"))
    }
}

fn print_summary(report: &Report) {
    println!(
        "{:<40} {:>12} {:>12} {:>12} {:>12}",
        "File", "Lines", "Statements", "Branches", "Functions"
    );
    for (path, stats) in &report.0 {
        let lines = ratio(stats.l.values().filter(|&&hits| hits > 0).count(), stats.l.len());
        let statements = ratio(stats.s.values().filter(|&&hits| hits > 0).count(), stats.s.len());
        let branch_hits =
            stats.b.values().flatten().filter(|&&hits| hits > 0).count();
        let branch_total = stats.b.values().map(Vec::len).sum();
        let branches = ratio(branch_hits, branch_total);
        let functions = ratio(stats.f.values().filter(|&&hits| hits > 0).count(), stats.f.len());
        println!("{path:<40} {lines:>12} {statements:>12} {branches:>12} {functions:>12}");
    }
}

fn ratio(hits: usize, total: usize) -> String {
    if total == 0 {
        "-".to_string()
    } else {
        format!("{hits}/{total}")
    }
}
