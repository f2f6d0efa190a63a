//! Test-case artifacts: one concrete input per explored path, enough to
//! replay the path deterministically.

use crate::error::TerminateReason;
use crate::expr::Width;
use crate::ir::CodePtr;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;
use std::io::{self, Write};

/// Bytes for one named symbolic object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestObject {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One mid-run symbolic draw and the value the solver picked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NondetEntry {
    pub name: String,
    pub width: Width,
    pub is_signed: bool,
    pub bytes: Vec<u8>,
}

impl NondetEntry {
    pub fn from_value(name: impl Into<String>, width: Width, is_signed: bool, value: u128) -> Self {
        let mut bytes = Vec::with_capacity(16);
        bytes
            .write_u128::<LittleEndian>(value)
            .expect("write into a vec cannot fail");
        bytes.truncate(((width + 7) / 8) as usize);
        Self {
            name: name.into(),
            width,
            is_signed,
            bytes,
        }
    }
}

/// The serialized outcome of one terminated state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestCase {
    pub objects: Vec<TestObject>,
    pub nondets: Vec<NondetEntry>,
    /// Error class, absent on normal exit.
    pub kind: Option<TerminateReason>,
    pub message: Option<String>,
    /// Last non-internal instruction, for error attribution.
    pub instruction: Option<CodePtr>,
    /// Branch decisions along the path.
    pub path: Vec<bool>,
}

impl TestCase {
    pub fn object(&self, name: &str) -> Option<&TestObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    pub fn is_error(&self) -> bool {
        self.kind.is_some()
    }

    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{}", self)
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.kind, &self.message) {
            (Some(kind), Some(message)) => writeln!(f, "status: {} ({})", kind, message)?,
            (Some(kind), None) => writeln!(f, "status: {}", kind)?,
            _ => writeln!(f, "status: exit")?,
        }
        if let Some(instruction) = self.instruction {
            writeln!(f, "instruction: {}", instruction)?;
        }
        for object in &self.objects {
            writeln!(f, "object {} = {:02x?}", object.name, object.bytes)?;
        }
        for nondet in &self.nondets {
            writeln!(
                f,
                "nondet {} ({}{}) = {:02x?}",
                nondet.name,
                if nondet.is_signed { "i" } else { "u" },
                nondet.width,
                nondet.bytes
            )?;
        }
        write!(
            f,
            "path: {}",
            self.path
                .iter()
                .map(|bit| if *bit { '1' } else { '0' })
                .collect::<String>()
        )
    }
}

/// Where finished test cases go. Serialization to disk, statistics, and
/// deduplicated error reporting all live behind this.
pub trait InterpreterHandler {
    fn process_test_case(&mut self, test: TestCase);

    fn inc_paths_explored(&mut self);
}

/// Keeps every test case in memory; the default for tests and the CLI.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    pub tests: Vec<TestCase>,
    pub paths_explored: u64,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> impl Iterator<Item = &TestCase> {
        self.tests.iter().filter(|t| t.is_error())
    }
}

impl InterpreterHandler for CollectingHandler {
    fn process_test_case(&mut self, test: TestCase) {
        self.tests.push(test);
    }

    fn inc_paths_explored(&mut self) {
        self.paths_explored += 1;
    }
}
