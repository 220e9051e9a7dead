//! The named-value scratchpad.

use std::sync::Arc;

use crate::{
    command::Outcome,
    error::{Error, Result},
    kernel::Kernel,
    matcher,
};

pub(crate) fn cmd_set(kernel: &Arc<Kernel>, mut args: Vec<String>) -> Result<Outcome> {
    if args.is_empty() {
        return Err(Error::Validation("set requires a name".into()));
    }
    let name = args.remove(0);
    let mut state = kernel.lock()?;
    if args.is_empty() {
        state.values.remove(&name);
    } else {
        state.values.insert(name, args.join(" "));
    }
    Ok(Outcome::reply(String::new()))
}

pub(crate) fn cmd_get(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    let name = args
        .first()
        .ok_or_else(|| Error::Validation("get requires a name".into()))?;
    let state = kernel.lock()?;
    Ok(Outcome::reply(state.values.get(name).cloned().unwrap_or_default()))
}

pub(crate) fn cmd_list(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    let state = kernel.lock()?;
    let lines: Vec<String> = matcher::select(&state.values, &args, false)?
        .into_iter()
        .map(|(name, value)| format!("{name} {value}"))
        .collect();
    Ok(Outcome::reply(lines.join("\n")))
}

pub(crate) fn cmd_remove(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    if args.is_empty() || args == ["*"] {
        return Err(Error::Validation("You cannot remove all variables".into()));
    }
    let mut state = kernel.lock()?;
    let names: Vec<String> = matcher::select(&state.values, &args, true)?
        .into_iter()
        .map(|(name, _)| name.to_owned())
        .collect();
    for name in names {
        state.values.remove(&name);
    }
    Ok(Outcome::reply(String::new()))
}
