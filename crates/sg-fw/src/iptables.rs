use regex::Regex;
use sg_core::exec::args;
use sg_core::{CommandOutput, CommandRunner, FirewallError, Result, ToolPaths};
use std::sync::LazyLock;

static REFERENCES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Chain \S+ \((\d+) references?\)").expect("valid regex"));

/// Outcome of [`Iptables::ensure_chain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Created,
    AlreadyExisted,
}

/// Thin wrapper around the `iptables` and `iptables-save` tools.
pub struct Iptables<'a> {
    runner: &'a dyn CommandRunner,
    program: &'a str,
    save_program: &'a str,
}

impl<'a> Iptables<'a> {
    pub fn new(runner: &'a dyn CommandRunner, tools: &'a ToolPaths) -> Self {
        Self {
            runner,
            program: &tools.iptables,
            save_program: &tools.iptables_save,
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

    /// `iptables-save` output, optionally limited to one table.
    pub fn save(&self, table: Option<&str>) -> Result<Vec<String>> {
        let argv = match table {
            Some(table) => args(["-t", table]),
            None => vec![],
        };
        let output = self.runner.run_checked(self.save_program, &argv)?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Every chain in `table`, built-in ones included.
    pub fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .save(Some(table))?
            .iter()
            .filter_map(|line| line.strip_prefix(':'))
            .filter_map(|rest| rest.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    pub fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        Ok(self.list_chains(table)?.iter().any(|c| c == chain))
    }

    /// Creates `chain` unless it is already present. Existing rules are kept.
    pub fn ensure_chain(&self, table: &str, chain: &str) -> Result<ChainStatus> {
        if self.chain_exists(table, chain)? {
            return Ok(ChainStatus::AlreadyExisted);
        }
        self.exec(table, &args(["-N", chain]))?;
        Ok(ChainStatus::Created)
    }

    /// Ensures `chain` exists and is empty.
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

    pub fn insert(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.rule_op(table, "-I", chain, spec)
    }

    pub fn delete_rule(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.rule_op(table, "-D", chain, spec)
    }

    /// Rules of `chain` in `-S` form, without the `-N`/`-P` header.
    pub fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let output = self.exec(table, &args(["-S", chain]))?;
        Ok(output
            .lines()
            .filter(|line| line.starts_with("-A "))
            .map(str::to_string)
            .collect())
    }

    /// Number of rules jumping to `chain`, from the `-L` header.
    pub fn references(&self, table: &str, chain: &str) -> Result<u32> {
        let output = self.exec(table, &args(["-n", "-L", chain]))?;
        let header = output.lines().next().unwrap_or_default();

        REFERENCES
            .captures(header)
            .and_then(|caps| caps[1].parse().ok())
            .ok_or_else(|| FirewallError::ChainNotFound {
                table: table.to_string(),
                chain: chain.to_string(),
            })
    }
}

/// Chain and rule spec of a saved `-A` line, as printed by `iptables-save`
/// or `ebtables -L --Lx`. Returns `None` for anything that is not a rule.
pub fn saved_rule(line: &str) -> Option<(String, Vec<String>)> {
    let mut tokens = line.split_whitespace().skip_while(|token| *token != "-A");
    tokens.next()?;
    let chain = tokens.next()?.to_string();
    Some((chain, tokens.map(str::to_string).collect()))
}

/// Whether a saved rule line mentions `word` as a whole token.
pub fn mentions(line: &str, word: &str) -> bool {
    line.split_whitespace().any(|token| token == word)
}
