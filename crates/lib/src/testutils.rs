//! Test doubles for the host command seam.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use osprov_utils::CommandExecutor;

type Handler = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Records every command instead of running it. Responses are chosen by
/// matching the start of the space-joined commandline; the most recently
/// registered match wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub(crate) struct FakeExecutor {
    commands: Mutex<Vec<String>>,
    stdin: Mutex<Vec<(String, Vec<u8>)>>,
    handlers: Mutex<Vec<(String, Handler)>>,
    missing: Mutex<HashSet<String>>,
    probes: Mutex<Vec<String>>,
}

impl std::fmt::Debug for FakeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeExecutor")
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl FakeExecutor {
    pub(crate) fn new_arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply to commands starting with `prefix` with `stdout`.
    pub(crate) fn respond(&self, prefix: &str, stdout: &str) {
        let stdout = stdout.to_owned();
        self.handle(prefix, move |_| Ok(stdout.clone()));
    }

    /// Fail commands starting with `prefix`, as if they printed `stderr`.
    pub(crate) fn fail(&self, prefix: &str, stderr: &str) {
        let stderr = stderr.to_owned();
        self.handle(prefix, move |cmd| {
            anyhow::bail!("Running {cmd}: Subprocess failed: exit status: 1\n{stderr}")
        });
    }

    pub(crate) fn handle(
        &self,
        prefix: &str,
        f: impl Fn(&str) -> Result<String> + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap()
            .push((prefix.to_owned(), Box::new(f)));
    }

    /// Pretend `program` is not installed.
    pub(crate) fn set_missing(&self, programs: &[&str]) {
        let mut missing = self.missing.lock().unwrap();
        missing.extend(programs.iter().map(|p| p.to_string()));
    }

    /// Commandlines run so far, program and arguments joined by spaces.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commandlines run so far which start with `prefix`.
    pub(crate) fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Data written to the stdin of the commands run so far.
    pub(crate) fn stdin(&self) -> Vec<(String, Vec<u8>)> {
        self.stdin.lock().unwrap().clone()
    }

    /// Programs looked up so far.
    pub(crate) fn probes(&self) -> Vec<String> {
        self.probes.lock().unwrap().clone()
    }
}

fn cmdline(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl CommandExecutor for FakeExecutor {
    fn execute(&self, cmd: &mut Command, stdin: Option<&[u8]>) -> Result<String> {
        let line = cmdline(cmd);
        self.commands.lock().unwrap().push(line.clone());
        if let Some(buf) = stdin {
            self.stdin.lock().unwrap().push((line.clone(), buf.to_vec()));
        }
        let handlers = self.handlers.lock().unwrap();
        match handlers.iter().rev().find(|(p, _)| line.starts_with(p.as_str())) {
            Some((_, h)) => h(&line),
            None => Ok(String::new()),
        }
    }

    fn find_program(&self, program: &str) -> Option<PathBuf> {
        self.probes.lock().unwrap().push(program.to_owned());
        if self.missing.lock().unwrap().contains(program) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(program))
        }
    }
}

/// A stateful stand-in for `efibootmgr`, tracking boot entries and order.
#[derive(Debug, Default)]
pub(crate) struct FakeFirmware {
    /// Entry number and label
    pub(crate) entries: Vec<(u16, String)>,
    pub(crate) order: Vec<u16>,
}

impl FakeFirmware {
    pub(crate) fn with_entries(entries: &[(u16, &str)]) -> Arc<Mutex<Self>> {
        let entries: Vec<_> = entries.iter().map(|(n, l)| (*n, l.to_string())).collect();
        let order = entries.iter().map(|(n, _)| *n).collect();
        Arc::new(Mutex::new(Self { entries, order }))
    }

    fn render(&self) -> String {
        let mut out = String::from("BootCurrent: 0001\nTimeout: 1 seconds\n");
        let order = self
            .order
            .iter()
            .map(|n| format!("{n:04X}"))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&format!("BootOrder: {order}\n"));
        for (n, label) in self.entries.iter() {
            out.push_str(&format!(
                "Boot{n:04X}* {label}\tHD(1,GPT,58a4c5f0-bd12-424c-b563-195ac65a25dd)\n"
            ));
        }
        out
    }

    fn apply(&mut self, line: &str) -> Result<String> {
        let args: Vec<&str> = line.split(' ').skip(1).collect();
        let arg_after = |flag: &str| {
            args.iter()
                .position(|a| *a == flag)
                .and_then(|i| args.get(i + 1))
                .copied()
        };
        if args.contains(&"-B") {
            let n = arg_after("-b").and_then(|n| u16::from_str_radix(n, 16).ok());
            let Some(n) = n else {
                anyhow::bail!("efibootmgr: invalid delete request: {line}");
            };
            self.entries.retain(|(e, _)| *e != n);
            self.order.retain(|e| *e != n);
        } else if args.contains(&"-c") {
            let label = arg_after("-L").unwrap_or("Linux").to_owned();
            let n = (0..=u16::MAX)
                .find(|n| !self.entries.iter().any(|(e, _)| e == n))
                .unwrap_or_default();
            self.entries.push((n, label));
            self.order.insert(0, n);
        } else if let Some(order) = arg_after("-o") {
            self.order = order
                .split(',')
                .map(|n| u16::from_str_radix(n, 16))
                .collect::<std::result::Result<_, _>>()?;
        }
        Ok(self.render())
    }

    /// Route all `efibootmgr` invocations on `exec` to `fw`.
    pub(crate) fn install(fw: &Arc<Mutex<Self>>, exec: &FakeExecutor) {
        let fw = Arc::clone(fw);
        exec.handle("efibootmgr", move |line| fw.lock().unwrap().apply(line));
    }
}
