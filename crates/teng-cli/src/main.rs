//! Command-line renderer: template + JSON data to stdout.
//!
//! ```text
//! teng TEMPLATE [DATA.json] [--dict FILE] [--config FILE] [--ctype NAME]
//! ```

use std::{env, fs, io, process::ExitCode};

use teng::{ErrorLog, Fragment, GenPageArgs, StreamWriter, Teng};

struct Options {
    template: String,
    data: Option<String>,
    dictionary: String,
    config: String,
    content_type: String,
    encoding: String,
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        template: String::new(),
        data: None,
        dictionary: String::new(),
        config: String::new(),
        content_type: String::new(),
        encoding: "utf-8".to_owned(),
    };

    let mut positional = Vec::new();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut named = |target: &mut String| match args.next() {
            Some(value) => {
                *target = value;
                Ok(())
            }
            None => Err(format!("missing value for {arg}")),
        };
        match arg.as_str() {
            "--dict" => named(&mut options.dictionary)?,
            "--config" => named(&mut options.config)?,
            "--ctype" => named(&mut options.content_type)?,
            "--encoding" => named(&mut options.encoding)?,
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    options.template = positional
        .next()
        .ok_or("usage: teng TEMPLATE [DATA.json] [--dict FILE] [--config FILE] [--ctype NAME]")?;
    options.data = positional.next();
    Ok(options)
}

fn load_data(path: Option<&str>) -> Result<Fragment, String> {
    let Some(path) = path else {
        return Ok(Fragment::new());
    };
    let text = fs::read_to_string(path).map_err(|err| format!("cannot read {path}: {err}"))?;
    serde_json::from_str(&text).map_err(|err| format!("invalid data in {path}: {err}"))
}

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };
    let data = match load_data(options.data.as_deref()) {
        Ok(data) => data,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let engine = Teng::new("");
    let args = GenPageArgs {
        dictionary: &options.dictionary,
        config: &options.config,
        content_type: &options.content_type,
        encoding: &options.encoding,
    };

    let mut writer = StreamWriter::new(io::stdout().lock());
    let mut log = ErrorLog::new();
    let result = engine.generate_page(&options.template, &args, &data, &mut writer, &mut log);
    drop(writer);

    if !log.is_empty() {
        eprint!("{log}");
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
