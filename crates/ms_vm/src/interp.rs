//! The host-facing interpreter: owns a parser and a machine, wires output
//! sinks, and drives compilation, execution, and the REPL loop.

use std::cell::RefCell;
use std::rc::Rc;

use ms_parser::Parser;
use ms_syntax::{new_code, Value};

use crate::{stdout_sink, Machine, OutputSink};

fn stderr_sink() -> OutputSink {
    Box::new(|text, eol| {
        if eol {
            eprintln!("{}", text);
        } else {
            eprint!("{}", text);
        }
    })
}

pub struct Interpreter {
    source: String,
    parser: Option<Parser>,
    machine: Option<Machine>,
    /// Held until the machine is created, then handed over.
    pending_output: Option<OutputSink>,
    implicit_output: Option<OutputSink>,
    error_output: OutputSink,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            source: String::new(),
            parser: None,
            machine: None,
            pending_output: None,
            implicit_output: None,
            error_output: stderr_sink(),
        }
    }

    pub fn with_source(source: &str) -> Self {
        let mut interp = Self::new();
        interp.source = source.to_string();
        interp
    }

    pub fn from_lines(lines: &[&str]) -> Self {
        Self::with_source(&lines.join("\n"))
    }

    pub fn set_source(&mut self, source: &str) {
        self.source = source.to_string();
        self.parser = None;
        self.machine = None;
    }

    /// Discard compiled state and take new source.
    pub fn reset(&mut self, source: &str) {
        self.set_source(source);
    }

    pub fn set_standard_output(&mut self, sink: OutputSink) {
        match &mut self.machine {
            Some(machine) => machine.set_standard_output(sink),
            None => self.pending_output = Some(sink),
        }
    }

    pub fn set_implicit_output(&mut self, sink: OutputSink) {
        self.implicit_output = Some(sink);
    }

    pub fn set_error_output(&mut self, sink: OutputSink) {
        self.error_output = sink;
    }

    fn report_error(&mut self, text: &str) {
        (self.error_output)(text, true);
    }

    fn take_output(&mut self) -> OutputSink {
        self.pending_output.take().unwrap_or_else(stdout_sink)
    }

    /// Compile the current source.  Reports a compiler error through the
    /// error sink and returns false on failure.
    pub fn compile(&mut self) -> bool {
        if self.machine.is_some() {
            return true;
        }
        let mut parser = Parser::new();
        match parser.parse(&self.source) {
            Ok(()) => {
                let code = Rc::new(RefCell::new(parser.program().to_vec()));
                let sink = self.take_output();
                self.machine = Some(Machine::with_output(code, sink));
                self.parser = Some(parser);
                true
            }
            Err(err) => {
                let message = err.to_string();
                self.report_error(&message);
                false
            }
        }
    }

    /// Rewind to the start of the program, clearing variables.
    pub fn restart(&mut self) {
        if let Some(machine) = &mut self.machine {
            machine.reset(true);
        }
    }

    pub fn stop(&mut self) {
        if let Some(machine) = &mut self.machine {
            machine.stop();
        }
    }

    pub fn running(&self) -> bool {
        match &self.machine {
            Some(machine) => !machine.done(),
            None => false,
        }
    }

    pub fn done(&self) -> bool {
        match &self.machine {
            Some(machine) => machine.done(),
            None => true,
        }
    }

    pub fn need_more_input(&self) -> bool {
        self.parser
            .as_ref()
            .map(Parser::need_more_input)
            .unwrap_or(false)
    }

    pub fn get_global_value(&mut self, name: &str) -> Option<Value> {
        self.machine.as_mut().and_then(|machine| machine.get_global(name))
    }

    pub fn set_global_value(&mut self, name: &str, value: Value) {
        if self.machine.is_none() && !self.compile() {
            return;
        }
        if let Some(machine) = &mut self.machine {
            machine.set_global(name, value);
        }
    }

    /// Run until done, yield, or the time budget expires.  Runtime errors
    /// are reported through the error sink and stop the program.
    pub fn run_until_done(&mut self, time_limit_secs: f64, return_early: bool) {
        if self.machine.is_none() && !self.compile() {
            return;
        }
        let machine = self.machine.as_mut().expect("compiled above");
        if let Err(err) = machine.run_until_done(time_limit_secs, return_early) {
            machine.stop();
            let message = err.to_string();
            self.report_error(&message);
        }
    }

    /// Execute a single TAC line.
    pub fn step(&mut self) {
        if self.machine.is_none() && !self.compile() {
            return;
        }
        let machine = self.machine.as_mut().expect("compiled above");
        if let Err(err) = machine.step() {
            machine.stop();
            let message = err.to_string();
            self.report_error(&message);
        }
    }

    /// Feed one line of interactive input.  Statements run as soon as they
    /// are complete; results of bare expressions echo through the implicit
    /// output sink.
    pub fn repl(&mut self, line: &str, time_limit_secs: f64) {
        if self.machine.is_none() {
            let sink = self.take_output();
            let mut machine = Machine::with_output(new_code(), sink);
            machine.store_implicit = true;
            self.machine = Some(machine);
        }
        if self.parser.is_none() {
            self.parser = Some(Parser::new());
        }

        let parser = self.parser.as_mut().expect("created above");
        if let Err(err) = parser.parse_repl(line) {
            parser.partial_reset();
            let message = err.to_string();
            self.report_error(&message);
            return;
        }
        if parser.need_more_input() {
            return;
        }

        let program = parser.program().to_vec();
        let machine = self.machine.as_mut().expect("created above");
        {
            let code = machine.global_code();
            *code.borrow_mut() = program;
        }
        let implicit_before = machine.implicit_result_count();
        if let Err(err) = machine.run_until_done(time_limit_secs, false) {
            machine.stop();
            let message = err.to_string();
            self.report_error(&message);
            return;
        }
        let machine = self.machine.as_mut().expect("created above");
        if machine.implicit_result_count() > implicit_before {
            if let Some(value) = machine.get_global("_") {
                if !value.is_null() {
                    let text = value.to_display_string();
                    match &mut self.implicit_output {
                        Some(sink) => sink(&text, true),
                        None => {
                            if let Some(machine) = &mut self.machine {
                                machine.write_output(&text, true);
                            }
                        }
                    }
                }
            }
        }
    }

    /// The compiled program, for TAC dumps.
    pub fn program_dump(&mut self) -> Option<String> {
        if self.machine.is_none() && !self.compile() {
            return None;
        }
        let machine = self.machine.as_ref()?;
        let code = machine.global_code();
        let text = ms_syntax::dump_code(&code.borrow());
        Some(text)
    }
}
