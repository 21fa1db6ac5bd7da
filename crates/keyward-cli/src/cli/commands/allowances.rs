use std::path::Path;

use keyward_core::AllowanceStore;

use super::super::args::AllowancesArgs;
use super::context::{fail, load_config};
use crate::exit_codes::SUCCESS;

pub(crate) async fn run(args: AllowancesArgs, config_path: Option<&Path>) -> anyhow::Result<i32> {
    let path = match args.file {
        Some(path) => path,
        None => {
            let resolved = load_config(config_path).and_then(|c| c.allowances_path());
            match resolved {
                Ok(path) => path,
                Err(e) => return Ok(fail(&e)),
            }
        }
    };

    let store = AllowanceStore::open(path).await;
    match store.to_json().await {
        Ok(json) => {
            println!("{json}");
            Ok(SUCCESS)
        }
        Err(e) => Ok(fail(&e)),
    }
}
