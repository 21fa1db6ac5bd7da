use std::path::Path;

use keyward_core::{HttpTranslator, IntentTranslator};

use super::super::args::PromptArgs;
use super::context::{build_processor, fail, load_config};
use super::report;
use crate::exit_codes::SUCCESS;

pub(crate) async fn run(args: PromptArgs, config_path: Option<&Path>) -> anyhow::Result<i32> {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => return Ok(fail(&e)),
    };
    let translator = match HttpTranslator::from_config(&config) {
        Ok(t) => t,
        Err(e) => return Ok(fail(&e)),
    };

    if args.dry_run {
        let translation = match translator.translate(&args.text).await {
            Ok(t) => t,
            Err(e) => return Ok(fail(&e)),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "payloads": translation.payloads,
                "attestation": translation.attestation.to_string(),
            }))?
        );
        return Ok(SUCCESS);
    }

    let processor = match build_processor(&config).await {
        Ok(p) => p,
        Err(e) => return Ok(fail(&e)),
    };
    match processor.process_prompt(&translator, &args.text).await {
        Ok(result) => report::print(&result, args.output),
        Err(e) => Ok(fail(&e)),
    }
}
