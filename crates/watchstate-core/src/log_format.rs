use std::collections::HashMap;

/// Resolve `%(key)` placeholders in a log template from a context map.
///
/// This is the stable wire format for user-facing log records; unknown keys
/// are left in place so a missing context entry is visible instead of silent.
pub fn interpolate(template: &str, context: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(')') {
            Some(end) => {
                let key = &after[..end];
                match context.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("%(");
                        out.push_str(key);
                        out.push(')');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
