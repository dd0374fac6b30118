use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::Cursor;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use pvestrap::ProvisionError;
use pvestrap::config::Profile;
use pvestrap::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use pvestrap::factory::{ArtifactStream, ImageFactory, ReleaseSource, SchematicId};
use pvestrap::prompt::{Choice, PromptOutcome, Prompter};
use url::Url;

/// Schematic id returned by [`FakeFactory`] by default.
#[allow(dead_code)]
pub const SCHEMATIC: &str = "ce4c980550dd2ab1b17bbf2b08801c7eb59418eafe8f279833297925d67c7515";

#[allow(dead_code)]
pub const PVESM_STATUS: &str = "\
Name             Type     Status           Total            Used       Available        %
local             dir     active        98497780        12345678        81084556   12.53%
local-lvm     lvmthin     active       832888832        20535414       812353417    2.47%
";

#[allow(dead_code)]
pub const PVESM_EMPTY: &str =
    "Name             Type     Status           Total            Used       Available        %\n";

#[allow(dead_code)]
pub const RESOURCES_EMPTY: &str = "[]";

#[allow(dead_code)]
pub const RESOURCES_WITH_100: &str =
    r#"[{"id":"qemu/100","type":"qemu","vmid":100,"node":"pve","status":"running"}]"#;

#[allow(dead_code)]
pub const IMPORT_OUTPUT: &str = "\
importing disk '/tmp/nocloud-amd64.qcow2' to VM 101 ...
transferred 1.2 GiB of 1.2 GiB (100.00%)
Successfully imported disk as 'unused0:local-lvm:vm-101-disk-1'
";

struct Rule {
    prefix: String,
    code: i32,
    stdout: String,
    stderr: String,
    remaining: Option<usize>,
}

/// Command executor answering from canned responses keyed by command-line prefix.
///
/// Unmatched commands succeed with empty output. With `dry_run` set, mutating
/// specs are recorded and skipped like the real executor does.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
    dry_run: bool,
}

#[allow(dead_code)]
impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    fn push(self, prefix: &str, code: i32, stdout: &str, stderr: &str, remaining: Option<usize>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            remaining,
        });
        self
    }

    /// Answers every command starting with `prefix` with `stdout`.
    pub fn on(self, prefix: &str, stdout: &str) -> Self {
        self.push(prefix, 0, stdout, "", None)
    }

    /// Answers only the next matching command; earlier rules win.
    pub fn once(self, prefix: &str, stdout: &str) -> Self {
        self.push(prefix, 0, stdout, "", Some(1))
    }

    /// Makes every command starting with `prefix` exit with `code`.
    pub fn fail(self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.push(prefix, code, "", stderr, None)
    }

    /// Typical healthy host: two storages, no guests, next id 101.
    pub fn healthy_host() -> Self {
        Self::new()
            .on("pvesm status", PVESM_STATUS)
            .on("pvesh get /cluster/resources", RESOURCES_EMPTY)
            .on("pvesh get /cluster/nextid", "101\n")
            .on("qm importdisk", IMPORT_OUTPUT)
    }

    /// Command lines executed or skipped, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(CommandSpec::display).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines of specs that may change host state.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.read_only)
            .map(CommandSpec::display)
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, spec: &CommandSpec) -> anyhow::Result<ExecutionResult> {
        self.calls.lock().unwrap().push(spec.clone());
        if self.dry_run && !spec.read_only {
            return Ok(ExecutionResult::default());
        }
        let line = spec.display();
        let mut rules = self.rules.lock().unwrap();
        let matched = rules
            .iter_mut()
            .find(|r| line.starts_with(&r.prefix) && r.remaining != Some(0));
        let (code, stdout, stderr) = match matched {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                (rule.code, rule.stdout.clone(), rule.stderr.clone())
            }
            None => (0, String::new(), String::new()),
        };
        Ok(ExecutionResult {
            status: Some(ExitStatus::from_raw(code << 8)),
            stdout,
            stderr,
        })
    }
}

/// In-memory image factory.
pub struct FakeFactory {
    pub image: Vec<u8>,
    /// Overrides the advertised content length
    pub advertised: Option<Option<u64>>,
    submit_errors: RefCell<VecDeque<ProvisionError>>,
    download_errors: RefCell<VecDeque<ProvisionError>>,
    pub submitted: RefCell<Vec<String>>,
    pub downloads: RefCell<Vec<Url>>,
}

#[allow(dead_code)]
impl FakeFactory {
    pub fn new() -> Self {
        Self {
            image: b"QFI\xfb fake qcow2 image".to_vec(),
            advertised: None,
            submit_errors: RefCell::new(VecDeque::new()),
            download_errors: RefCell::new(VecDeque::new()),
            submitted: RefCell::new(Vec::new()),
            downloads: RefCell::new(Vec::new()),
        }
    }

    pub fn failing_submit(self, err: ProvisionError) -> Self {
        self.submit_errors.borrow_mut().push_back(err);
        self
    }

    pub fn failing_download(self, err: ProvisionError) -> Self {
        self.download_errors.borrow_mut().push_back(err);
        self
    }

    pub fn network_calls(&self) -> usize {
        self.submitted.borrow().len() + self.downloads.borrow().len()
    }
}

impl ImageFactory for FakeFactory {
    fn submit_schematic(&self, schematic_yaml: &str) -> Result<SchematicId, ProvisionError> {
        self.submitted.borrow_mut().push(schematic_yaml.to_string());
        if let Some(err) = self.submit_errors.borrow_mut().pop_front() {
            return Err(err);
        }
        SchematicId::new(SCHEMATIC)
    }

    fn open_artifact(&self, url: &Url) -> Result<ArtifactStream, ProvisionError> {
        self.downloads.borrow_mut().push(url.clone());
        if let Some(err) = self.download_errors.borrow_mut().pop_front() {
            return Err(err);
        }
        Ok(ArtifactStream {
            content_length: self.advertised.unwrap_or(Some(self.image.len() as u64)),
            reader: Box::new(Cursor::new(self.image.clone())),
        })
    }
}

/// Release feed with a fixed answer.
pub struct FakeReleases {
    pub answer: Result<&'static str, &'static str>,
    pub calls: Cell<usize>,
}

#[allow(dead_code)]
impl FakeReleases {
    pub fn ok(tag: &'static str) -> Self {
        Self {
            answer: Ok(tag),
            calls: Cell::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: Err("HTTP 503 Service Unavailable"),
            calls: Cell::new(0),
        }
    }
}

impl ReleaseSource for FakeReleases {
    fn latest_version(&self) -> Result<String, ProvisionError> {
        self.calls.set(self.calls.get() + 1);
        self.answer
            .map(str::to_string)
            .map_err(|e| ProvisionError::fetch(e.to_string()))
    }
}

/// A scripted answer.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Answer {
    Text(&'static str),
    Yes,
    No,
    Cancel,
}

/// Interactive prompter replaying scripted answers; defaults once exhausted.
#[derive(Default)]
pub struct ScriptedPrompter {
    answers: RefCell<VecDeque<Answer>>,
    pub asked: RefCell<Vec<String>>,
}

#[allow(dead_code)]
impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            asked: RefCell::new(Vec::new()),
        }
    }

    fn next(&self, title: &str) -> Option<Answer> {
        self.asked.borrow_mut().push(title.to_string());
        self.answers.borrow_mut().pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.answers.borrow().len()
    }
}

impl Prompter for ScriptedPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    fn input(&self, title: &str, _prompt: &str, default: &str) -> anyhow::Result<PromptOutcome<String>> {
        Ok(match self.next(title) {
            Some(Answer::Text(text)) => PromptOutcome::Answered(text.to_string()),
            Some(Answer::Cancel) => PromptOutcome::Cancelled,
            Some(other) => panic!("unexpected answer {:?} for input '{}'", other, title),
            None => PromptOutcome::Answered(default.to_string()),
        })
    }

    fn select(
        &self,
        title: &str,
        _prompt: &str,
        choices: &[Choice],
        default: &str,
    ) -> anyhow::Result<PromptOutcome<String>> {
        Ok(match self.next(title) {
            Some(Answer::Text(tag)) => {
                assert!(choices.iter().any(|c| c.tag == tag), "'{}' is not a choice", tag);
                PromptOutcome::Answered(tag.to_string())
            }
            Some(Answer::Cancel) => PromptOutcome::Cancelled,
            Some(other) => panic!("unexpected answer {:?} for select '{}'", other, title),
            None => PromptOutcome::Answered(default.to_string()),
        })
    }

    fn confirm(&self, title: &str, _prompt: &str, default_yes: bool) -> anyhow::Result<PromptOutcome<bool>> {
        Ok(match self.next(title) {
            Some(Answer::Yes) => PromptOutcome::Answered(true),
            Some(Answer::No) => PromptOutcome::Answered(false),
            Some(Answer::Cancel) => PromptOutcome::Cancelled,
            Some(other) => panic!("unexpected answer {:?} for confirm '{}'", other, title),
            None => PromptOutcome::Answered(default_yes),
        })
    }
}

/// Talos profile downloading into `scratch`, with explicit version and no retry delay.
#[allow(dead_code)]
pub fn talos_profile(scratch: Utf8PathBuf) -> Profile {
    let mut profile = Profile::default();
    profile.talos.version = "v1.9.0".to_string();
    profile.factory.scratch_dir = Some(scratch);
    profile.factory.retry_delay_ms = 0;
    profile
}

/// Container profile for an EteSync server.
#[allow(dead_code)]
pub fn container_profile(setup: &[&str]) -> Profile {
    pvestrap::config::parse_profile(&format!(
        "kind: container\ndefaults:\n  name: etesync\n  cores: 1\n  memory: 1024\n  disk: 8\ncontainer:\n  template: local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst\n  setup: [{}]\n",
        setup
            .iter()
            .map(|s| format!("{:?}", s))
            .collect::<Vec<_>>()
            .join(", ")
    ))
    .expect("container profile parses")
}

/// Creates a UTF-8 temp dir for scratch downloads.
#[allow(dead_code)]
pub fn scratch_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
    (dir, path)
}

/// Number of entries left in a directory.
#[allow(dead_code)]
pub fn entries(dir: &Utf8PathBuf) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
