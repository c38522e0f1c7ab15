use crate::error::BootstrapError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cmd_lib::*;
use rand::RngCore;

pub const PASSWORD_LEN: usize = 25;
const MIN_RECOMMENDED_LEN: usize = 12;

/// 25 alphanumeric characters taken from base64 encoded random bytes with
/// `=`, `+` and `/` dropped.
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    let mut password = String::with_capacity(PASSWORD_LEN);
    while password.len() < PASSWORD_LEN {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        password.extend(
            STANDARD
                .encode(bytes)
                .chars()
                .filter(|c| !matches!(c, '=' | '+' | '/'))
                .take(PASSWORD_LEN - password.len()),
        );
    }
    password
}

/// Returns the supplied password after sanity checks, or a fresh one.
pub fn password_or_generate(supplied: Option<&str>, what: &str) -> Result<(String, bool), BootstrapError> {
    match supplied {
        None => Ok((generate_password(), true)),
        Some("") => Err(BootstrapError::InvalidArgument(format!(
            "{what} password must not be empty"
        ))),
        Some(p) if p.chars().any(char::is_control) => Err(BootstrapError::InvalidArgument(
            format!("{what} password must not contain control characters"),
        )),
        Some(p) => {
            if p.len() < MIN_RECOMMENDED_LEN {
                warn!("{what} password is shorter than {MIN_RECOMMENDED_LEN} characters");
            }
            Ok((p.to_string(), false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_password_shape() {
        for _ in 0..200 {
            let password = generate_password();
            assert_eq!(password.len(), PASSWORD_LEN);
            assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(!password.contains(['=', '+', '/']));
        }
    }

    #[test]
    fn test_generated_passwords_differ() {
        let passwords: HashSet<String> = (0..50).map(|_| generate_password()).collect();
        assert_eq!(passwords.len(), 50);
    }

    #[test]
    fn test_supplied_password() {
        let (password, generated) = password_or_generate(Some("s3cret-but-long"), "superuser").unwrap();
        assert_eq!(password, "s3cret-but-long");
        assert!(!generated);

        let (password, generated) = password_or_generate(None, "replicator").unwrap();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(generated);

        assert!(password_or_generate(Some(""), "superuser").is_err());
        assert!(password_or_generate(Some("bad\npassword"), "superuser").is_err());
    }
}
