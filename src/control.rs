//! Control identifiers.
//!
//! A control is addressed by a dotted name of the form
//! `<prefix>_<namespace>.<constructor>`, for example `cc_Contoso.MyControl`.
//! The host page's registry keys controls by the short name, which is the
//! identifier with its prefix segment stripped.

use anyhow::{bail, Result};
use std::fmt;

/// A fully qualified control identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ControlName(String);

impl ControlName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            bail!("control name must not be empty");
        }
        if !name.contains('.') {
            bail!("control name {name:?} is not of the form <prefix>_<namespace>.<constructor>");
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier with its prefix segment stripped, e.g.
    /// `cc_Contoso.MyControl` becomes `Contoso.MyControl`.
    ///
    /// The prefix is only recognized when the underscore precedes the first
    /// dot; underscores inside the constructor segment are left alone.
    pub fn short_name(&self) -> &str {
        let dot = match self.0.find('.') {
            Some(ix) => ix,
            None => return &self.0,
        };
        match self.0[..dot].find('_') {
            Some(underscore) => &self.0[underscore + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for ControlName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("cc_Contoso.MyControl", "Contoso.MyControl")]
    #[case("cc_Acme.Widget", "Acme.Widget")]
    #[case("Acme.Widget", "Acme.Widget")]
    #[case("prefix_Ns.With_Underscore", "Ns.With_Underscore")]
    fn short_name_strips_prefix(#[case] full: &str, #[case] short: &str) {
        let control = ControlName::new(full).unwrap();
        assert_eq!(control.short_name(), short);
    }

    #[test]
    fn rejects_names_without_constructor_segment() {
        assert!(ControlName::new("cc_Contoso").is_err());
        assert!(ControlName::new("").is_err());
        assert!(ControlName::new("   ").is_err());
    }
}
