use std::path::Path;

use anyhow::{Result, bail};

use mycelium::{Env, Options, Program, State, Vm, cid};

use super::util::{open_store, parse_ref};

const DEFAULT_RUN_STEPS: u64 = 10_000_000;

pub(crate) fn cmd_run(store: &Path, options: Options, program: &str, steps: Option<u64>) -> Result<()> {
    let store = open_store(store)?;
    let key = parse_ref(program)?;
    let bytes = store.read(&key, Some(&cid::NO_SALT))?;
    let program = Program::decode(&bytes)?;

    let mut vm = Vm::new(Env::new(store)?.with_options(options));
    let ty = vm.load(&program)?;
    let budget = steps.unwrap_or(DEFAULT_RUN_STEPS);
    let executed = vm.run(budget);
    match vm.state() {
        State::Halted => {}
        State::Running => bail!("program did not halt within {budget} steps"),
        State::Faulted => {
            if let Some(err) = vm.take_error() {
                return Err(err.into());
            }
            bail!("program faulted");
        }
    }
    match vm.result(&ty) {
        Ok(value) => println!("{value} : {ty}"),
        Err(_) => println!("{ty}"),
    }
    let words = vm.stack().iter().map(|w| format!("{w:#010x}")).collect::<Vec<_>>();
    println!("[{}]  ({executed} steps)", words.join(" "));
    Ok(())
}
