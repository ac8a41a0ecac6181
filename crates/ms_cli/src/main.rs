use std::cell::RefCell;
use std::env;
use std::fs;
use std::rc::Rc;

use ms_vm::Interpreter;

fn print_usage() {
    eprintln!("miniscript - an embeddable MiniScript interpreter");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  miniscript                        Start interactive REPL");
    eprintln!("  miniscript <file.ms>              Run a script");
    eprintln!("  miniscript --dump-tac <file.ms>   Dump TAC before and after running");
    eprintln!("  miniscript --test                 Run built-in quick checks");
    eprintln!("  miniscript --test --integration <file>");
    eprintln!("                                    Run an integration suite file");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h, --help     Show this help message");
    eprintln!("  -v, --version  Show version information");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        print_usage();
        return;
    }
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-v") {
        println!("miniscript {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if args.len() > 1 && args[1] == "--test" {
        if args.len() > 3 && args[2] == "--integration" {
            run_integration_suite(&args[3]);
        } else {
            run_quick_checks();
        }
        return;
    }

    if args.len() > 2 && args[1] == "--dump-tac" {
        run_file(&args[2], true);
        return;
    }

    if args.len() > 1 {
        run_file(&args[1], false);
        return;
    }

    run_repl();
}

fn run_file(path: &str, dump_tac: bool) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("can't read {}: {}", path, err);
            return;
        }
    };
    let mut interp = Interpreter::with_source(&source);
    if !interp.compile() {
        return;
    }
    if dump_tac {
        if let Some(dump) = interp.program_dump() {
            println!("--- TAC before execution ---");
            print!("{}", dump);
        }
    }
    interp.run_until_done(60.0, false);
    while !interp.done() {
        // A cooperative yield returns control; keep going until the
        // program actually finishes.
        interp.run_until_done(60.0, false);
    }
    if dump_tac {
        if let Some(dump) = interp.program_dump() {
            println!("--- TAC after execution ---");
            print!("{}", dump);
        }
    }
}

fn run_repl() {
    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(_) => {
            eprintln!("failed to start line editor");
            return;
        }
    };
    let history_path = env::var("HOME")
        .ok()
        .map(|home| std::path::PathBuf::from(home).join(".miniscript_history"));
    if let Some(path) = history_path.as_ref() {
        let _ = rl.load_history(path);
    }

    let mut interp = Interpreter::new();
    println!("miniscript {}", env!("CARGO_PKG_VERSION"));

    loop {
        let prompt = if interp.need_more_input() { ">>> " } else { "> " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(_) => break,
        };
        if line.trim() == "exit" || line.trim() == "quit" {
            break;
        }
        if !line.trim().is_empty() {
            let _ = rl.add_history_entry(line.as_str());
        }
        interp.repl(&line, 60.0);
    }

    if let Some(path) = history_path.as_ref() {
        let _ = rl.append_history(path);
    }
}

/// Run a script with captured output; returns (stdout+implicit, errors).
fn run_captured(source: &str) -> (String, String) {
    let out = Rc::new(RefCell::new(String::new()));
    let err = Rc::new(RefCell::new(String::new()));
    let mut interp = Interpreter::with_source(source);
    let out_handle = Rc::clone(&out);
    interp.set_standard_output(Box::new(move |text, eol| {
        out_handle.borrow_mut().push_str(text);
        if eol {
            out_handle.borrow_mut().push('\n');
        }
    }));
    let err_handle = Rc::clone(&err);
    interp.set_error_output(Box::new(move |text, eol| {
        err_handle.borrow_mut().push_str(text);
        if eol {
            err_handle.borrow_mut().push('\n');
        }
    }));
    interp.run_until_done(30.0, false);
    while !interp.done() {
        interp.run_until_done(30.0, false);
    }
    let stdout = out.borrow().clone();
    let stderr = err.borrow().clone();
    (stdout, stderr)
}

fn run_quick_checks() {
    let cases: &[(&str, &str)] = &[
        ("print 6*7", "42\n"),
        (
            "f = function(x)\n  return x*3\nend function\nprint f(14)",
            "42\n",
        ),
        ("x = [1,2,3]\nx.push 42\nprint x.sum", "48\n"),
        ("for i in range(3,1)\n  print i\nend for", "3\n2\n1\n"),
        (
            "d = {\"a\":1}\nd.b = 2\nprint d.values.sum",
            "3\n",
        ),
        ("print \"Hi\"\"There\"", "Hi\"There\n"),
        (
            "if 1 < 2 < 3 then print \"ok\" else print \"no\"",
            "ok\n",
        ),
        (
            "a = [3,1,2]; a.sort; print a.join(\"-\")",
            "1-2-3\n",
        ),
    ];
    let mut failures = 0;
    for (index, (source, expected)) in cases.iter().enumerate() {
        let (stdout, stderr) = run_captured(source);
        if stdout == *expected && stderr.is_empty() {
            println!("check {}: ok", index + 1);
        } else {
            failures += 1;
            println!("check {}: FAILED", index + 1);
            println!("  source:   {}", source.replace('\n', "\\n"));
            println!("  expected: {:?}", expected);
            println!("  got:      {:?}", stdout);
            if !stderr.is_empty() {
                println!("  errors:   {:?}", stderr);
            }
        }
    }
    if failures == 0 {
        println!("all checks passed");
    } else {
        println!("{} check(s) failed", failures);
    }
}

/// Integration suite format: test blocks separated by lines of `====`,
/// with the expected output following a `----` line inside each block.
fn run_integration_suite(path: &str) {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("can't read {}: {}", path, err);
            return;
        }
    };

    let mut passed = 0usize;
    let mut failed = 0usize;
    for (index, block) in split_blocks(&content).iter().enumerate() {
        let (source, expected) = match split_case(block) {
            Some(parts) => parts,
            None => continue,
        };
        let (stdout, stderr) = run_captured(&source);
        let mut got = stdout;
        got.push_str(&stderr);
        if got == expected {
            passed += 1;
        } else {
            failed += 1;
            println!("test {} FAILED", index + 1);
            println!("---- source ----");
            print!("{}", source);
            println!("---- expected ----");
            print!("{}", expected);
            println!("---- got ----");
            print!("{}", got);
            println!("----");
        }
    }
    println!("{} passed, {} failed", passed, failed);
}

fn split_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.starts_with("====") {
            if !current.trim().is_empty() {
                blocks.push(current.clone());
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        blocks.push(current);
    }
    blocks
}

fn split_case(block: &str) -> Option<(String, String)> {
    let mut source = String::new();
    let mut expected = String::new();
    let mut in_expected = false;
    for line in block.lines() {
        if line.starts_with("----") {
            in_expected = true;
            continue;
        }
        if in_expected {
            expected.push_str(line);
            expected.push('\n');
        } else {
            source.push_str(line);
            source.push('\n');
        }
    }
    if source.trim().is_empty() {
        return None;
    }
    Some((source, expected))
}
