//! Crate-internal helpers for UID values

use std::borrow::Cow;

/// Drop trailing NUL padding from a UID,
/// allocating only when there is padding to drop.
pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with('\0') {
        Cow::Owned(uid.trim_end_matches('\0').to_string())
    } else {
        uid
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::trim_uid;

    #[test]
    fn trim_uid_only_drops_padding() {
        assert_eq!(trim_uid(Cow::from("1.2.840.10008.1.2.1")), "1.2.840.10008.1.2.1");
        assert_eq!(trim_uid(Cow::from("1.2.840.10008.1.2.1\0")), "1.2.840.10008.1.2.1");
        // NULs in the middle are left alone
        assert_eq!(trim_uid(Cow::from("1.2\0.3")), "1.2\0.3");
    }
}
