use std::{env, fs, process::ExitCode, time::Instant};

use slake::{LoadFlags, Reference, Runtime, ValueData, ValueId};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { &args[1] } else { "example.slx" };
    let entry_point = if args.len() > 2 { args[2].as_str() } else { "main" };

    let data = match read_file(file_path) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut rt = Runtime::new();
    let start = Instant::now();
    if let Err(err) = rt.load_module(&data, LoadFlags::NONE) {
        eprintln!("error loading module: {err}");
        return ExitCode::FAILURE;
    }

    let name = rt.interns.intern(entry_point);
    let func = match rt.resolve(&Reference::single(name)) {
        Ok(f) => f,
        Err(err) => {
            eprintln!(
                "error: entry point `{entry_point}` not found ({} of {} path entries resolved)",
                err.resolved_entries,
                err.reference.entries.len()
            );
            return ExitCode::FAILURE;
        }
    };

    let this = rt.heap.none();
    let result = match rt.call(func, this, &[]) {
        Ok(v) => v,
        Err(err) => {
            let elapsed = start.elapsed();
            eprintln!("error after {elapsed:?}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let elapsed = start.elapsed();
    eprintln!("success after {elapsed:?}");
    println!("{}", display_value(&rt, result));
    ExitCode::SUCCESS
}

/// Renders a result value for the terminal. Only handles the primitive
/// kinds a demo entry point would plausibly return; anything else prints
/// its runtime type name.
fn display_value(rt: &Runtime, id: ValueId) -> String {
    match rt.heap.get(id).map(|v| &v.data) {
        Some(ValueData::None) => "none".to_owned(),
        Some(ValueData::Bool(b)) => b.to_string(),
        Some(ValueData::I8(n)) => n.to_string(),
        Some(ValueData::I16(n)) => n.to_string(),
        Some(ValueData::I32(n)) => n.to_string(),
        Some(ValueData::I64(n)) => n.to_string(),
        Some(ValueData::U8(n)) => n.to_string(),
        Some(ValueData::U16(n)) => n.to_string(),
        Some(ValueData::U32(n)) => n.to_string(),
        Some(ValueData::U64(n)) => n.to_string(),
        Some(ValueData::F32(n)) => n.to_string(),
        Some(ValueData::F64(n)) => n.to_string(),
        Some(ValueData::Str(s)) => s.clone(),
        Some(data) => format!("<{}>", data.type_name()),
        None => "<freed>".to_owned(),
    }
}

fn read_file(file_path: &str) -> Result<Vec<u8>, String> {
    eprintln!("reading module: {file_path}");
    match fs::metadata(file_path) {
        Ok(metadata) if !metadata.is_file() => return Err(format!("{file_path} is not a file")),
        Ok(_) => {}
        Err(err) => return Err(format!("error reading {file_path}: {err}")),
    }
    fs::read(file_path).map_err(|err| format!("error reading file: {err}"))
}
