//! Name selection over the registries: literal matches and trailing-`*`
//! wildcards.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Selects entries of `map` by the given patterns, in name order.
///
/// No patterns at all (or a lone `*`) selects everything. A pattern with
/// a trailing `*` selects by prefix and may legitimately come up empty;
/// with `required`, a literal pattern that matches nothing is an error.
pub fn select<'m, V>(
    map: &'m BTreeMap<String, V>,
    patterns: &[String],
    required: bool,
) -> Result<Vec<(&'m str, &'m V)>> {
    let mut matched: BTreeSet<&'m str> = BTreeSet::new();
    if patterns.is_empty() {
        matched.extend(map.keys().map(String::as_str));
    } else {
        for pattern in patterns {
            if let Some(prefix) = pattern.strip_suffix('*') {
                if prefix.is_empty() {
                    matched.extend(map.keys().map(String::as_str));
                } else {
                    matched.extend(
                        map.keys().filter(|name| name.starts_with(prefix)).map(String::as_str),
                    );
                }
            } else if let Some((name, _)) = map.get_key_value(pattern) {
                matched.insert(name.as_str());
            } else if required {
                return Err(Error::Lookup(format!("{pattern} not found")));
            }
        }
    }
    Ok(matched.into_iter().map(|name| (name, &map[name])).collect())
}
