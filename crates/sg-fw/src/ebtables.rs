use crate::iptables::ChainStatus;
use regex::Regex;
use sg_core::exec::args;
use sg_core::{CommandOutput, CommandRunner, Result, ToolPaths};
use std::sync::LazyLock;

static BRIDGE_CHAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Bridge chain: ([^,\s]+),").expect("valid regex"));

/// Thin wrapper around the `ebtables` tool.
pub struct Ebtables<'a> {
    runner: &'a dyn CommandRunner,
    program: &'a str,
}

impl<'a> Ebtables<'a> {
    pub fn new(runner: &'a dyn CommandRunner, tools: &'a ToolPaths) -> Self {
        Self {
            runner,
            program: &tools.ebtables,
        }
    }

    fn exec(&self, table: &str, rest: &[String]) -> Result<CommandOutput> {
        let mut argv = args(["-t", table]);
        argv.extend_from_slice(rest);
        self.runner.run_checked(self.program, &argv)
    }

    fn rule_op(&self, table: &str, op: &str, chain: &str, spec: &[String]) -> Result<()> {
        let mut argv = args([op, chain]);
        argv.extend_from_slice(spec);
        self.exec(table, &argv)?;
        Ok(())
    }

    pub fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let output = self.exec(table, &args(["-L"]))?;
        Ok(output
            .lines()
            .filter_map(|line| BRIDGE_CHAIN.captures(line))
            .map(|caps| caps[1].to_string())
            .collect())
    }

    pub fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        Ok(self.list_chains(table)?.iter().any(|c| c == chain))
    }

    pub fn ensure_chain(&self, table: &str, chain: &str) -> Result<ChainStatus> {
        if self.chain_exists(table, chain)? {
            return Ok(ChainStatus::AlreadyExisted);
        }
        self.exec(table, &args(["-N", chain]))?;
        Ok(ChainStatus::Created)
    }

    pub fn reset_chain(&self, table: &str, chain: &str) -> Result<ChainStatus> {
        let status = self.ensure_chain(table, chain)?;
        if status == ChainStatus::AlreadyExisted {
            self.flush(table, chain)?;
        }
        Ok(status)
    }

    pub fn flush(&self, table: &str, chain: &str) -> Result<()> {
        self.exec(table, &args(["-F", chain]))?;
        Ok(())
    }

    pub fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.exec(table, &args(["-X", chain]))?;
        Ok(())
    }

    pub fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.rule_op(table, "-A", chain, spec)
    }

    pub fn delete_rule(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.rule_op(table, "-D", chain, spec)
    }

    /// Table contents as replayable `ebtables -t <table> -A ...` commands.
    pub fn save(&self, table: &str) -> Result<Vec<String>> {
        let output = self.exec(table, &args(["-L", "--Lx"]))?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Rules of `chain` as printed by `-L`.
    pub fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let output = self.exec(table, &args(["-L", chain]))?;
        Ok(output
            .lines()
            .filter(|line| !line.starts_with("Bridge "))
            .map(str::to_string)
            .collect())
    }
}
