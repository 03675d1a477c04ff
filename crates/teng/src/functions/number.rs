//! Numeric builtins.

use rand::Rng;

use crate::value::{Number, Value};

use super::{FunctionCtx, FunctionResult};

/// Largest supported rounding precision, either direction.
const MAX_PRECISION: i64 = 39;

/// `random(range)`: uniform integer in `[0, range)`.
pub(super) fn random<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("random(): invalid number of arguments".to_owned());
    };
    match arg.as_number() {
        Some(Number::Int(range)) if range >= 1 => {
            Ok(Value::Int(rand::thread_rng().gen_range(0..range)))
        }
        _ => Err("random(): Missing or negative range.".to_owned()),
    }
}

/// `round(number, precision)`: decimal rounding; negative precision rounds
/// left of the decimal point.
pub(super) fn round<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [number, precision] = args else {
        return Err("round(): invalid number of arguments".to_owned());
    };
    let Some(value) = number.as_number() else {
        return Err("round(): argument is not a number".to_owned());
    };
    let Some(Number::Int(precision)) = precision.as_number() else {
        return Err("round(): precision must be an integer".to_owned());
    };
    if !(-MAX_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err("round(): precision out of range".to_owned());
    }

    match value {
        Number::Int(int_value) => {
            if precision >= 0 {
                return Ok(Value::Int(int_value));
            }
            let mut k = int_value;
            let sign = if k < 0 { -1 } else { 1 };
            for _ in 0..-precision {
                k = (k + sign * 5) / 10;
            }
            for _ in 0..-precision {
                k *= 10;
            }
            Ok(Value::Int(k))
        }
        Number::Real(real_value) => {
            let factor = 10f64.powi(precision as i32);
            Ok(Value::Real((real_value * factor).round() / factor))
        }
    }
}

/// `numformat(number, precision[, decimal-point[, thousand-separator]])`:
/// rounding plus human-readable grouping.
pub(super) fn numformat<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    if args.len() < 2 || args.len() > 4 {
        return Err("numformat(): invalid number of arguments".to_owned());
    }
    let Some(number) = args[0].as_number() else {
        return Err("numformat(): argument is not a number".to_owned());
    };
    let Some(Number::Int(precision)) = args[1].as_number() else {
        return Err("numformat(): precision must be an integer".to_owned());
    };
    if !(-MAX_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err("numformat(): precision out of range".to_owned());
    }
    let decipoint = args
        .get(2)
        .map(|v| v.to_string_value().into_owned())
        .unwrap_or_else(|| ".".to_owned());
    let thousandsep = args
        .get(3)
        .map(|v| v.to_string_value().into_owned())
        .unwrap_or_default();

    let mut num = number.as_real();
    let negative = num < 0.0;
    if negative {
        num = -num;
    }

    // round, keeping the scaled value for the fraction digits
    let factor = 10f64.powi(precision.unsigned_abs() as i32);
    let mut scaled = 0.0;
    if precision <= 0 {
        num = (num / factor).round() * factor;
    } else {
        scaled = (num * factor).round();
        num = scaled / factor;
    }

    // integer part with thousand grouping
    let mut n = num.trunc() as i64;
    let mut integer_part = String::new();
    if n == 0 {
        if precision > 0 && negative {
            integer_part.push('-');
        }
        integer_part.push('0');
    } else {
        let mut groups = Vec::new();
        while n > 0 {
            groups.push((n % 1000) as u32);
            n /= 1000;
        }
        for (i, group) in groups.iter().enumerate().rev() {
            if i == groups.len() - 1 {
                if negative {
                    integer_part.push('-');
                }
                integer_part.push_str(&group.to_string());
            } else {
                integer_part.push_str(&thousandsep);
                integer_part.push_str(&format!("{group:03}"));
            }
        }
    }

    // fraction digits from the scaled value
    if precision > 0 {
        let mut n = scaled as i64;
        let mut fraction = String::new();
        for _ in 0..precision {
            fraction.insert(0, char::from(b'0' + (n % 10) as u8));
            n /= 10;
        }
        integer_part.push_str(&decipoint);
        integer_part.push_str(&fraction);
    }

    Ok(Value::String(integer_part))
}

/// `int(value)`: truncating conversion; non-numeric strings fail.
pub(super) fn int<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("int(): invalid number of arguments".to_owned());
    };
    match arg.as_number() {
        Some(Number::Int(v)) => Ok(Value::Int(v)),
        Some(Number::Real(v)) => Ok(Value::Int(v as i64)),
        None => Err("int(): Cannot convert string to int.".to_owned()),
    }
}

/// `isnumber(value)`: true for integer and real values, not for numeric
/// strings.
pub(super) fn isnumber<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("isnumber(): invalid number of arguments".to_owned());
    };
    Ok(Value::from(matches!(arg, Value::Int(_) | Value::Real(_))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contenttype::{Escaper, default_descriptor};

    fn call<'a>(handler: super::super::Handler, args: &[Value<'a>]) -> FunctionResult<'a> {
        let escaper = Escaper::new(default_descriptor());
        let mut ctx = FunctionCtx::new(&escaper, "utf-8");
        handler(args, &mut ctx)
    }

    #[test]
    fn round_reals_and_ints() {
        let Ok(Value::Real(v)) = call(round, &[Value::Real(1234.56789), Value::Int(2)]) else {
            panic!()
        };
        assert!((v - 1234.57).abs() < 1e-9);

        let Ok(Value::Int(v)) = call(round, &[Value::Int(1234), Value::Int(-2)]) else {
            panic!()
        };
        assert_eq!(v, 1200);

        let Ok(Value::Real(v)) = call(round, &[Value::Real(1234.56), Value::Int(-2)]) else {
            panic!()
        };
        assert!((v - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn numformat_grouping() {
        let Ok(Value::String(s)) = call(
            numformat,
            &[
                Value::Real(1234567.891),
                Value::Int(2),
                Value::String(",".to_owned()),
                Value::String(" ".to_owned()),
            ],
        ) else {
            panic!()
        };
        assert_eq!(s, "1 234 567,89");
    }

    #[test]
    fn numformat_zero_precision() {
        let Ok(Value::String(s)) = call(numformat, &[Value::Real(1999.6), Value::Int(0)]) else {
            panic!()
        };
        assert_eq!(s, "2000");
    }

    #[test]
    fn int_conversions() {
        assert!(matches!(call(int, &[Value::Real(2.9)]), Ok(Value::Int(2))));
        assert!(matches!(
            call(int, &[Value::String("42".to_owned())]),
            Ok(Value::Int(42))
        ));
        assert!(call(int, &[Value::String("many".to_owned())]).is_err());
    }

    #[test]
    fn isnumber_checks_the_type() {
        assert!(matches!(call(isnumber, &[Value::Int(1)]), Ok(Value::Int(1))));
        assert!(matches!(
            call(isnumber, &[Value::String("1".to_owned())]),
            Ok(Value::Int(0))
        ));
    }

    #[test]
    fn random_range() {
        for _ in 0..32 {
            let Ok(Value::Int(v)) = call(random, &[Value::Int(5)]) else {
                panic!()
            };
            assert!((0..5).contains(&v));
        }
        assert!(call(random, &[Value::Int(0)]).is_err());
    }
}
