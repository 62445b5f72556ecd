use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use camino::Utf8PathBuf;
use rsprovision::backends::SshInstaller;
use rsprovision::backends::docker::OsRelease;
use rsprovision::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use rsprovision::http::{HttpClient, HttpRequest, HttpResponse};
use rsprovision::inventory::Inventory;
use tempfile::TempDir;

type Hook = Box<dyn Fn(&CommandSpec) + Send + Sync>;

struct Rule {
    prefix: String,
    replies: VecDeque<ExecutionResult>,
    hook: Option<Hook>,
}

/// Executor returning scripted results keyed by command-line prefix.
///
/// The first rule whose prefix matches wins. A rule with several replies
/// hands them out in order and repeats the last one. Unmatched commands
/// succeed with empty output.
#[derive(Default)]
#[allow(dead_code)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

#[allow(dead_code)]
impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for commands whose rendered line starts with `prefix`.
    pub fn on(self, prefix: &str, reply: ExecutionResult) -> Self {
        self.on_each(prefix, [reply])
    }

    pub fn on_each(self, prefix: &str, replies: impl IntoIterator<Item = ExecutionResult>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            replies: replies.into_iter().collect(),
            hook: None,
        });
        self
    }

    /// Like [`MockExecutor::on`], running `hook` before replying.
    pub fn on_with(
        self,
        prefix: &str,
        reply: ExecutionResult,
        hook: impl Fn(&CommandSpec) + Send + Sync + 'static,
    ) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            replies: VecDeque::from([reply]),
            hook: Some(Box::new(hook)),
        });
        self
    }

    /// Rendered command lines of every call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(CommandSpec::command_line).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl CommandExecutor for MockExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        self.calls.lock().unwrap().push(spec.clone());
        let line = spec.command_line();
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| line.starts_with(&r.prefix)) else {
            return Ok(ExecutionResult::ok(""));
        };
        if let Some(hook) = &rule.hook {
            hook(spec);
        }
        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        };
        Ok(reply.unwrap_or_default())
    }
}

/// HTTP client replaying scripted responses and recording every request.
#[derive(Default)]
#[allow(dead_code)]
pub struct FakeHttp {
    responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

#[allow(dead_code)]
impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, status: u16, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(HttpResponse::new(status, body)));
        self
    }

    /// Queues a transport failure.
    pub fn fail(self, message: &str) -> Self {
        self.responses.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpClient for FakeHttp {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => anyhow::bail!("{}", message),
            None => anyhow::bail!("unexpected request to {}", request.url),
        }
    }
}

/// Installer recording the containers it was asked to prepare.
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingInstaller {
    pub fail: bool,
    pub installs: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl RecordingInstaller {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn installs(&self) -> Vec<(String, String)> {
        self.installs.lock().unwrap().clone()
    }
}

impl SshInstaller for RecordingInstaller {
    fn install(&self, _executor: &dyn CommandExecutor, container: &str, os: &OsRelease) -> Result<()> {
        self.installs
            .lock()
            .unwrap()
            .push((container.to_string(), os.id().to_string()));
        if self.fail {
            anyhow::bail!("sshd did not start in {}", container);
        }
        Ok(())
    }
}

/// A scratch directory and the inventory file path inside it.
#[allow(dead_code)]
pub fn temp_inventory() -> Result<(TempDir, Utf8PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = Utf8PathBuf::from_path_buf(dir.path().join("inventory.yaml"))
        .map_err(|p| anyhow::anyhow!("non UTF-8 temp path: {}", p.display()))?;
    Ok((dir, path))
}

/// Reads the inventory from disk again, bypassing the per-process cache.
#[allow(dead_code)]
pub fn reload(path: &Utf8PathBuf) -> Result<Inventory> {
    Ok(Inventory::load(path)?)
}

