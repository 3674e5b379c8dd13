//! Creation rules for `add_max_object`
//!
//! Classes whose defaults routinely produce broken patches are refused up front unless the
//! caller opts out with the matching flag.

use serde_json::Value as JsonValue;

const FLOAT_REQUIRED: &[&str] = &["+", "-", "*", "/", "!+", "!-", "!*", "!/", "%", "pow", "scale"];
const PACK_OBJECTS: &[&str] = &["pack", "pak", "unpack"];
const REPLACED: &[(&str, &str)] = &[("times~", "*~")];
const MIN_ARGS: &[(&str, usize, &str)] = &[(
    "comb~",
    5,
    "[comb~ maxdelay delay feedback feedforward gain] e.g. [comb~ 1000 100 0.9 0.5 1.]",
)];
const MAX_DIAL_SIZE: f64 = 255.0;

/// Opt-outs accepted alongside an `add_max_object` step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateFlags {
    pub int_mode: bool,
    pub extend: bool,
    pub use_live_dial: bool,
    pub trigger_rtl: bool,
}

/// A float literal, or a numeric string written with a decimal point.
fn is_float_arg(arg: &JsonValue) -> bool {
    match arg {
        JsonValue::Number(n) => !n.is_i64() && !n.is_u64(),
        JsonValue::String(s) => s.contains('.') && s.parse::<f64>().is_ok(),
        _ => false,
    }
}

fn is_pack_float_arg(arg: &JsonValue) -> bool {
    is_float_arg(arg) || arg.as_str().is_some_and(|s| s.eq_ignore_ascii_case("f"))
}

/// `scale` with a narrow output range is assumed to be used for floats.
fn scale_float_intent(obj_type: &str, args: &[JsonValue]) -> bool {
    if obj_type != "scale" || args.len() < 4 {
        return false;
    }
    match (args[2].as_f64(), args[3].as_f64()) {
        (Some(lo), Some(hi)) => (hi - lo).abs() <= 2.0,
        _ => false,
    }
}

fn range_violation(obj_type: &str, args: &[JsonValue]) -> Option<String> {
    match obj_type {
        "svf~" => args.get(1).and_then(JsonValue::as_f64).filter(|q| *q >= 1.0).map(|q| {
            format!("PARAM RANGE: svf~ Q/resonance should be 0-1, not 0-100. Got {q}. Set extend=true if you really want Q >= 1.")
        }),
        "onepole~" => args.first().and_then(JsonValue::as_f64).filter(|f| *f < 10.0).map(|f| {
            format!("PARAM RANGE: onepole~ takes frequency in Hz (e.g., 5000), not a coefficient. Got {f}. Set extend=true if you really want frequency < 10 Hz.")
        }),
        _ => None,
    }
}

fn attr_value<'a>(args: &'a [JsonValue], attr: &str) -> Option<&'a JsonValue> {
    let idx = args.iter().position(|a| a.as_str() == Some(attr))?;
    args.get(idx + 1)
}

/// Check an object request before it reaches the peer. Returns the refusal message.
pub fn check_create(obj_type: &str, args: &[JsonValue], flags: CreateFlags) -> Option<String> {
    let obj_type = obj_type.trim();

    if let Some((_, replacement)) = REPLACED.iter().find(|(name, _)| *name == obj_type) {
        return Some(format!(
            "WRONG OBJECT: '{obj_type}' does not exist. Use '{replacement}' instead."
        ));
    }

    if let Some((_, min, usage)) = MIN_ARGS.iter().find(|(name, _, _)| *name == obj_type) {
        if args.len() < *min {
            return Some(format!(
                "MISSING ARGUMENTS: '{obj_type}' requires at least {min} arguments. Usage: {usage}"
            ));
        }
    }

    if FLOAT_REQUIRED.contains(&obj_type)
        && !flags.int_mode
        && !args.iter().any(is_float_arg)
        && !scale_float_intent(obj_type, args)
    {
        return Some(format!(
            "FLOAT REQUIRED: '{obj_type}' defaults to integer mode which truncates floats. \
             Use string args with '.' to preserve float type, e.g. [\"0\", \"127\", \"0\", \"25.\"]. \
             Or set int_mode=true if integer truncation is intended."
        ));
    }

    if PACK_OBJECTS.contains(&obj_type) && !flags.int_mode && !args.iter().any(is_pack_float_arg) {
        return Some(format!(
            "FLOAT REQUIRED: '{obj_type}' with integer arguments outputs integers. \
             Use the 'f' type specifier, string args with '.', or set int_mode=true if integer output is intended."
        ));
    }

    if !flags.extend {
        if let Some(message) = range_violation(obj_type, args) {
            return Some(message);
        }
    }

    if obj_type == "live.dial" && !flags.use_live_dial {
        return Some(
            "USE DIAL INSTEAD: live.dial outputs 0-127 with no inline range control. \
             Use [dial] with @size, @min and @floatoutput attributes, or set use_live_dial=true."
                .to_string(),
        );
    }

    if obj_type == "dial" {
        if !args.iter().any(|a| a.as_str() == Some("@size")) {
            return Some("RANGE REQUIRED: dial needs an explicit @size attribute, e.g. ['@size', 127].".to_string());
        }
        let oversized = attr_value(args, "@size")
            .and_then(JsonValue::as_f64)
            .filter(|size| *size > MAX_DIAL_SIZE);
        if let (Some(size), false) = (oversized, flags.extend) {
            return Some(format!(
                "DIAL SIZE TOO LARGE: @size {} creates an unusable dial. Use a number box instead, \
                 or set extend=true to bypass this check.",
                size as i64
            ));
        }
    }

    if (obj_type == "trigger" || obj_type == "t") && !flags.trigger_rtl {
        return Some(
            "ORDER ACKNOWLEDGMENT REQUIRED: trigger/t fires outlets right-to-left. \
             Set trigger_rtl=true to acknowledge the ordering."
                .to_string(),
        );
    }

    if obj_type == "coll" {
        let embedded = attr_value(args, "@embed").is_some_and(|v| v.as_i64() == Some(1));
        if !embedded {
            return Some(
                "EMBED REQUIRED: coll data does not persist on save unless @embed 1 is set, \
                 e.g. ['mycoll', '@embed', 1]."
                    .to_string(),
            );
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(obj_type: &str, args: JsonValue) -> Option<String> {
        let args = args.as_array().cloned().unwrap_or_default();
        check_create(obj_type, &args, CreateFlags::default())
    }

    #[test]
    fn test_replaced_and_short_objects() {
        assert!(check("times~", json!([])).unwrap().contains("'*~'"));
        assert!(check("comb~", json!([1000, 100])).unwrap().starts_with("MISSING ARGUMENTS"));
        assert!(check("comb~", json!([1000, 100, 0.9, 0.5, "1."])).is_none());
        assert!(check("cycle~", json!([440])).is_none());
    }

    #[test]
    fn test_float_requirements() {
        assert!(check("*", json!([2])).unwrap().starts_with("FLOAT REQUIRED"));
        assert!(check("*", json!(["2."])).is_none());
        assert!(check("*", json!([0.5])).is_none());
        assert!(check("scale", json!([0, 127, 0, 1])).is_none());
        assert!(check("pack", json!([0, 0])).is_some());
        assert!(check("pack", json!(["f", "f"])).is_none());

        let int_mode = CreateFlags {
            int_mode: true,
            ..CreateFlags::default()
        };
        assert!(check_create("*", &[json!(2)], int_mode).is_none());
    }

    #[test]
    fn test_ranges_and_acknowledgements() {
        assert!(check("svf~", json!([1000, 50])).unwrap().starts_with("PARAM RANGE"));
        let extend = CreateFlags {
            extend: true,
            ..CreateFlags::default()
        };
        assert!(check_create("svf~", &[json!(1000), json!(50)], extend).is_none());

        assert!(check("live.dial", json!([])).is_some());
        assert!(check("dial", json!([])).unwrap().starts_with("RANGE REQUIRED"));
        assert!(check("dial", json!(["@size", 1000])).unwrap().starts_with("DIAL SIZE"));
        assert!(check("dial", json!(["@size", 127])).is_none());
        assert!(check("t", json!(["b", "b"])).is_some());
        assert!(check("coll", json!(["store"])).is_some());
        assert!(check("coll", json!(["store", "@embed", 1])).is_none());
    }
}
