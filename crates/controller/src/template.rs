use minijinja::{Error, ErrorKind, State};

/// `top.field` of the object being rendered, as a string.
pub(crate) fn state_str(state: &State, top: &str, field: &str) -> Result<String, Error> {
    state_opt_str(state, top, field)?
        .ok_or_else(|| Error::new(ErrorKind::UndefinedError, format!("{}.{} is not set", top, field)))
}

pub(crate) fn state_opt_str(state: &State, top: &str, field: &str) -> Result<Option<String>, Error> {
    let Some(v) = state.lookup(top) else { return Ok(None) };
    if v.is_undefined() || v.is_none() {
        return Ok(None);
    }
    let f = v.get_attr(field)?;
    Ok(f.as_str().map(str::to_string))
}

pub(crate) fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, msg.into())
}
