//! Command-line front end.
//! Run with: netforge [--int8-model <int8.pb>] <model.pb> <windows.json> <out_dir> [options.json] [quantize.json]

use netforge::compiler::{Compiler, WindowSpec};
use netforge::config::CompileOptions;
use netforge::model::{load_graph, QuantizeInfo};
use std::error::Error;
use std::fs;
use std::path::Path;

const USAGE: &str =
    "usage: netforge [--int8-model <int8.pb>] <model.pb> <windows.json> <out_dir> [options.json] [quantize.json]";

/// Removes `flag <value>` from `args`, returning the value.
fn take_flag(args: &mut Vec<String>, flag: &str) -> Result<Option<String>, Box<dyn Error>> {
    let Some(i) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if i + 1 >= args.len() {
        return Err(format!("{} needs a path\n{}", flag, USAGE).into());
    }
    let value = args.remove(i + 1);
    args.remove(i);
    Ok(Some(value))
}

fn run(mut args: Vec<String>) -> Result<(), Box<dyn Error>> {
    let int8_model = take_flag(&mut args, "--int8-model")?;
    let [model, windows, out_dir, rest @ ..] = args.as_slice() else {
        return Err(USAGE.into());
    };
    let graph = load_graph(model)?;
    let windows: Vec<WindowSpec> = serde_json::from_str(&fs::read_to_string(windows)?)?;
    let options = match rest.first() {
        Some(path) => CompileOptions::load(path)?,
        None if !graph.name.is_empty() => CompileOptions {
            net_name: graph.name.clone(),
            ..Default::default()
        },
        None => CompileOptions::default(),
    };
    let mut compiler = Compiler::new().with_options(options).with_default_patterns();
    if let Some(path) = rest.get(1) {
        compiler = compiler.with_quantize_info(QuantizeInfo::load(path)?);
    }
    if let Some(path) = int8_model {
        compiler = compiler.with_int8_model(load_graph(path)?);
    }

    let result = compiler.compile(&graph, &windows)?;
    let out_dir = Path::new(out_dir);
    fs::create_dir_all(out_dir)?;
    let source = out_dir.join(format!("{}.cpp", compiler.options.net_name.to_lowercase()));
    fs::write(&source, &result.code)?;
    let chunks = result.write_artifacts(out_dir)?;

    println!("Wrote {} and {} weight chunks", source.display(), chunks.len());
    for d in &result.diagnostics {
        println!("  skipped {} ({}) in {}", d.layer, d.kind, d.function);
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_take_int8_flag() {
        let mut a = args(&["net.pb", "--int8-model", "net_int8.pb", "w.json", "out"]);
        let path = take_flag(&mut a, "--int8-model").unwrap();
        assert_eq!(path.as_deref(), Some("net_int8.pb"));
        assert_eq!(a, args(&["net.pb", "w.json", "out"]));

        let mut plain = args(&["net.pb", "w.json", "out"]);
        assert_eq!(take_flag(&mut plain, "--int8-model").unwrap(), None);
        assert_eq!(plain.len(), 3);
    }

    #[test]
    fn test_int8_flag_without_path() {
        let mut a = args(&["net.pb", "w.json", "out", "--int8-model"]);
        assert!(take_flag(&mut a, "--int8-model").is_err());
    }
}
