/// Extracts the method component from an RPC `:path` of the form
/// `/Service/Method`.
pub fn from_path(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Canonicalizes an RPC method identifier for the backend query string: a
/// hyphen is inserted before every uppercase letter except a leading one, then
/// the whole string is lowercased. `GetUserInfo` becomes `get-user-info`,
/// `URL` becomes `u-r-l`. Idempotent on already-canonical input.
pub fn canonicalize(method: &str) -> String {
    let mut out = String::with_capacity(method.len() + 4);
    for (i, ch) in method.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms() {
        assert_eq!(canonicalize("GetUserInfo"), "get-user-info");
        assert_eq!(canonicalize("URL"), "u-r-l");
        assert_eq!(canonicalize("fooBar"), "foo-bar");
        assert_eq!(canonicalize("A"), "a");
        assert_eq!(canonicalize(""), "");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for method in ["GetUserInfo", "URL", "fooBar", "A", "already-canonical9"] {
            let once = canonicalize(method);
            assert_eq!(canonicalize(&once), once);
        }
    }

    #[test]
    fn canonical_form_shape() {
        // Lowercase, digits and hyphens only; no leading hyphen; no runs of
        // hyphens.
        for method in ["GetUserInfo", "URL", "HTTPServer2", "getV2Info"] {
            let canonical = canonicalize(method);
            assert!(canonical
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            assert!(!canonical.starts_with('-'));
            assert!(!canonical.contains("--"));
        }
    }

    #[test]
    fn method_from_path() {
        assert_eq!(from_path("/user.UserService/GetUserInfo"), "GetUserInfo");
        assert_eq!(from_path("/Svc/M"), "M");
        assert_eq!(from_path("bare"), "bare");
    }
}
