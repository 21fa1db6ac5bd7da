use std::io::Read;
use std::path::Path;

use anyhow::Context;
use keyward_core::{parse_payloads, KeywardError};

use super::super::args::ApplyArgs;
use super::context::{build_processor, fail, load_config};
use super::report;

pub(crate) async fn run(args: ApplyArgs, config_path: Option<&Path>) -> anyhow::Result<i32> {
    let text = if args.file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read payloads from stdin")?;
        buf
    } else {
        match std::fs::read_to_string(&args.file) {
            Ok(text) => text,
            Err(e) => {
                return Ok(fail(&KeywardError::Config {
                    message: format!("cannot read {}: {e}", args.file.display()),
                }))
            }
        }
    };
    let payloads = match parse_payloads(&text) {
        Ok(p) => p,
        Err(e) => return Ok(fail(&e)),
    };

    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => return Ok(fail(&e)),
    };
    let processor = match build_processor(&config).await {
        Ok(p) => p,
        Err(e) => return Ok(fail(&e)),
    };

    let result = processor.process(&payloads).await;
    report::print(&result, args.output)
}
