//! Deterministic object paths for published OS objects

/// Base under which every OS object is published
pub const BASE_OBJECT_PATH: &str = "/org/projectatomic/rpmostree1";

/// Append each of `parts` to `base` as an escaped path element.
///
/// `[A-Za-z0-9]` pass through unchanged, every other byte becomes `_xx`.
/// The same input always yields the same path.
pub fn generate_object_path(base: &str, parts: &[&str]) -> String {
    let mut path = String::from(base.trim_end_matches('/'));
    for part in parts {
        path.push('/');
        escape_element(&mut path, part);
    }
    path
}

/// Object path of the OS named `osname`
pub fn os_object_path(osname: &str) -> String {
    generate_object_path(BASE_OBJECT_PATH, &[osname])
}

fn escape_element(out: &mut String, element: &str) {
    if element.is_empty() {
        out.push('_');
        return;
    }
    for byte in element.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name() {
        assert_eq!(
            os_object_path("fedora"),
            "/org/projectatomic/rpmostree1/fedora"
        );
    }

    #[test]
    fn test_escaping() {
        assert_eq!(
            os_object_path("fedora-atomic"),
            "/org/projectatomic/rpmostree1/fedora_2datomic"
        );
        assert_eq!(
            generate_object_path("/base", &["a_b", "c.d"]),
            "/base/a_5fb/c_2ed"
        );
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(os_object_path("rhel"), os_object_path("rhel"));
        assert_ne!(os_object_path("rhel"), os_object_path("centos"));
    }

    #[test]
    fn test_empty_element() {
        assert_eq!(generate_object_path("/base/", &[""]), "/base/_");
    }
}
