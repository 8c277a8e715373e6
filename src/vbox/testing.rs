//! Scripted stand-ins for the tool and the operator, for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::transport::{ExecOutput, Transport};
use crate::error::VbError;
use crate::prompt::Prompter;

/// Usage text with the commands the controller relies on.
pub const USAGE: &str = "\
Oracle VM VirtualBox Command Line Management Interface Version 6.1.50

Usage:

VBoxManage [<general option>] <command>

Commands:

  list [--long|-l] [--sorted|-s]   vms|runningvms|ostypes|hostdvds|hostfloppies|
                            intnets|bridgedifs|hostonlyifs|natnets|dhcpservers|
  showvminfo                <uuid|vmname> [--details]
  registervm                <filename>
  unregistervm              <uuid|vmname> [--delete]
  createvm                  --name <name>
                            [--register]
  modifyvm                  <uuid|vmname>
                            [--name <name>]
  startvm                   <uuid|vmname>...
  controlvm                 <uuid|vmname>
                            pause|resume|reset|poweroff|savestate|
  storageattach             <uuid|vmname>
                            --storagectl <name>
  storagectl                <uuid|vmname>
                            --name <name>
  createmedium              [disk|dvd|floppy] --filename <filename>
  guestproperty             get <uuid|vmname>
  hostonlyif                ipconfig <name>
  dhcpserver                add|modify --netname <network_name> |
";

#[derive(Debug)]
struct Expectation {
    args: Vec<String>,
    output: ExecOutput,
}

#[derive(Debug, Default)]
struct MockState {
    expected: VecDeque<Expectation>,
    calls: Vec<Vec<String>>,
}

/// A transport that checks each invocation against a queue of expected
/// argument lists and answers with canned output.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

fn text_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&self, args: &[&str], code: i32, stdout: &str, stderr: &str) -> &Self {
        self.state.lock().unwrap().expected.push_back(Expectation {
            args: args.iter().map(|a| a.to_string()).collect(),
            output: ExecOutput {
                code: Some(code),
                stdout: text_lines(stdout),
                stderr: text_lines(stderr),
            },
        });
        self
    }

    /// The bare `VBoxManage` call that discovers the command table.
    pub fn expect_usage(&self) -> &Self {
        self.expect(&[], 0, USAGE, "")
    }

    pub fn expect_vms(&self, names: &[&str]) -> &Self {
        let out: String = names
            .iter()
            .enumerate()
            .map(|(i, n)| format!("\"{n}\" {{00000000-0000-0000-0000-00000000000{i}}}\n"))
            .collect();
        self.expect(&["list", "vms"], 0, &out, "")
    }

    pub fn expect_vminfo(&self, name: &str, info: &VmInfo) -> &Self {
        self.expect(&["showvminfo", "--machinereadable", name], 0, &info.render(), "")
    }

    /// Number of invocations that happened so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose sub-command is `subcommand`.
    pub fn calls_to(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(subcommand))
            .collect()
    }

    pub fn assert_done(&self) {
        let state = self.state.lock().unwrap();
        let left: Vec<_> = state.expected.iter().map(|e| e.args.join(" ")).collect();
        assert!(left.is_empty(), "expected calls never happened: {left:#?}");
    }
}

impl Transport for MockTransport {
    async fn exec(&self, args: &[String]) -> Result<ExecOutput, VbError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(args.to_vec());
        let Some(next) = state.expected.pop_front() else {
            panic!("unexpected call: VBoxManage {}", args.join(" "));
        };
        assert_eq!(
            next.args,
            args,
            "call #{} did not match the script",
            state.calls.len()
        );
        Ok(next.output)
    }

    fn describe(&self, args: &[String]) -> String {
        std::iter::once("VBoxManage".to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builder for `showvminfo --machinereadable` output.
#[derive(Debug, Clone, Default)]
pub struct VmInfo {
    values: BTreeMap<String, String>,
}

impl VmInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: &str) -> Self {
        self.values.insert("VMState".into(), state.into());
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn storagectl(mut self, index: usize, name: &str, kind: &str) -> Self {
        self.values
            .insert(format!("storagecontrollername{index}"), name.into());
        self.values
            .insert(format!("storagecontrollertype{index}"), kind.into());
        self
    }

    pub fn render(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\"\n"))
            .collect()
    }
}

/// Answers every confirmation with a fixed value and records the questions.
#[derive(Debug, Clone)]
pub struct FixedPrompter {
    answer: bool,
    asked: Arc<Mutex<Vec<String>>>,
}

impl FixedPrompter {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: Arc::default(),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

impl Prompter for FixedPrompter {
    fn confirm(&self, question: &str) -> Result<bool, VbError> {
        self.asked.lock().unwrap().push(question.to_string());
        Ok(self.answer)
    }
}
