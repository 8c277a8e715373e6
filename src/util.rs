use crate::error::VbError;

/// Parse a disk size into the mebibytes `VBoxManage createhd --size` expects.
///
/// A bare number is already in MB (`"102400"`). Suffixed values use binary
/// units: `"20G"` is 20480, `"1T"` is 1048576, `"512M"` is 512.
pub fn parse_size_mb(s: &str) -> Result<u64, VbError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(VbError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.trim().parse().map_err(|_| VbError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "M" | "MB" => 1,
        "G" | "GB" => 1024,
        "T" | "TB" => 1024 * 1024,
        _ => {
            return Err(VbError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use M, G or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| VbError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Coerce the usual spellings of a boolean setting.
pub fn parse_bool(s: &str) -> Result<bool, VbError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(VbError::Validation {
            message: format!("'{other}' is not a boolean (use true/false, yes/no, on/off)"),
        }),
    }
}
