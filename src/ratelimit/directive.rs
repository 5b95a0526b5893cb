//! Parser for the `ratelimit` directive file format.
//!
//! ```text
//! # comment
//! ratelimit 2 2 second {
//!     allowLocalIPs 127.0.0.0/8
//!     resources GET /api /v2
//! }
//! ratelimit /login 5 10 minute
//! ```
//!
//! The three argument form is `rate burst unit` followed by a block; the
//! four argument form is `path rate burst unit` and applies to any method.

use ipnetwork::IpNetwork;

use super::bucket::{Limit, Unit};
use super::rules::{Resource, Rule};
use crate::error::{Result, TollgateError};
use crate::net;

const DIRECTIVE: &str = "ratelimit";
const ALLOW_LOCAL_IPS: &str = "allowLocalIPs";
const RESOURCES: &str = "resources";

/// A block-form rule whose closing brace has not been seen yet.
struct OpenBlock {
    line: usize,
    limit: Limit,
    resources: Vec<Resource>,
    allow_local_ips: Vec<IpNetwork>,
}

/// Parse every `ratelimit` directive in `text`.
pub fn parse(text: &str) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    let mut block: Option<OpenBlock> = None;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let tokens: Vec<&str> = strip_comment(raw).split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        if let Some(mut open) = block.take() {
            if tokens[0] == "}" {
                if tokens.len() > 1 {
                    return Err(at(line, "unexpected tokens after '}'"));
                }
                let rule = Rule::new(open.limit, open.resources, open.allow_local_ips)
                    .map_err(|e| with_line(open.line, e))?;
                rules.push(rule);
            } else {
                parse_block_line(&mut open, &tokens).map_err(|e| with_line(line, e))?;
                block = Some(open);
            }
            continue;
        }

        if tokens[0] != DIRECTIVE {
            return Err(at(line, &format!("expected '{}', found '{}'", DIRECTIVE, tokens[0])));
        }

        let mut args = &tokens[1..];
        let opens_block = args.last() == Some(&"{");
        if opens_block {
            args = &args[..args.len() - 1];
        }

        match args.len() {
            3 => {
                let limit = parse_limit(args[0], args[1], args[2]).map_err(|e| with_line(line, e))?;
                if !opens_block {
                    return Err(at(line, "rule has no resources"));
                }
                block = Some(OpenBlock {
                    line,
                    limit,
                    resources: Vec::new(),
                    allow_local_ips: Vec::new(),
                });
            }
            4 => {
                if opens_block {
                    return Err(at(line, "the inline form does not take a block"));
                }
                rules.push(parse_inline(args).map_err(|e| with_line(line, e))?);
            }
            n => {
                return Err(at(line, &format!("expected 3 or 4 arguments, got {}", n)));
            }
        }
    }

    if let Some(open) = block {
        return Err(at(open.line, "block is never closed"));
    }

    Ok(rules)
}

fn parse_block_line(open: &mut OpenBlock, tokens: &[&str]) -> Result<()> {
    match tokens[0] {
        ALLOW_LOCAL_IPS => {
            if tokens.len() < 2 {
                return Err(TollgateError::Config("allowLocalIPs needs at least one CIDR".into()));
            }
            for cidr in &tokens[1..] {
                open.allow_local_ips.push(net::parse_cidr(cidr)?);
            }
        }
        RESOURCES => {
            if tokens.len() < 3 {
                return Err(TollgateError::Config("missing method and resources".into()));
            }
            let method = tokens[1];
            for path in &tokens[2..] {
                open.resources.push(Resource::parse(method, path)?);
            }
        }
        other => {
            return Err(TollgateError::Config(format!("unknown setting '{}'", other)));
        }
    }
    Ok(())
}

fn parse_inline(args: &[&str]) -> Result<Rule> {
    let limit = parse_limit(args[1], args[2], args[3])?;
    let resource = Resource::parse("*", args[0])?;
    Rule::new(limit, vec![resource], Vec::new())
}

fn parse_limit(rate: &str, burst: &str, unit: &str) -> Result<Limit> {
    let rate = rate
        .parse::<u64>()
        .map_err(|_| TollgateError::Config(format!("invalid rate '{}'", rate)))?;
    let burst = burst
        .parse::<u64>()
        .map_err(|_| TollgateError::Config(format!("invalid burst '{}'", burst)))?;
    let unit = unit.parse::<Unit>()?;
    Limit::new(rate, burst, unit)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn at(line: usize, message: &str) -> TollgateError {
    TollgateError::Config(format!("line {}: {}", line, message))
}

fn with_line(line: usize, err: TollgateError) -> TollgateError {
    match err {
        TollgateError::Config(message) => at(line, &message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::MethodMatch;

    fn config_message(err: TollgateError) -> String {
        match err {
            TollgateError::Config(message) => message,
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_block_form() {
        let text = r#"
# API limits
ratelimit 2 2 second {
    allowLocalIPs 127.0.0.0/8 10.0.0.0/8
    resources GET /api /v2
    resources * ^/health
}
"#;
        let rules = parse(text).unwrap();
        assert_eq!(rules.len(), 1);

        let rule = &rules[0];
        assert_eq!(rule.limit, Limit::new(2, 2, Unit::Second).unwrap());
        assert_eq!(rule.allow_local_ips.len(), 2);
        assert_eq!(rule.resources.len(), 3);
        assert_eq!(rule.resources[0].identity(), "GET /api");
        assert_eq!(rule.resources[1].identity(), "GET /v2");
        assert!(rule.resources[2].exempt);
        assert_eq!(rule.resources[2].method, MethodMatch::Any);
    }

    #[test]
    fn test_parse_inline_form() {
        let rules = parse("ratelimit /login 5 10 minute\nratelimit ^/status 1 1 second").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].limit, Limit::new(5, 10, Unit::Minute).unwrap());
        assert_eq!(rules[0].resources[0].method, MethodMatch::Any);
        assert_eq!(rules[0].resources[0].path.as_str(), "/login");
        assert!(rules[1].resources[0].exempt);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("# nothing here\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_argument_count() {
        let message = config_message(parse("ratelimit 1 2").unwrap_err());
        assert_eq!(message, "line 1: expected 3 or 4 arguments, got 2");
    }

    #[test]
    fn test_malformed_numbers_and_unit() {
        assert!(parse("ratelimit /a x 1 second").is_err());
        assert!(parse("ratelimit /a 1 -1 second").is_err());
        assert!(parse("ratelimit /a 0 1 second").is_err());

        let message = config_message(parse("\nratelimit /a 1 1 week").unwrap_err());
        assert!(message.starts_with("line 2:"), "{}", message);
    }

    #[test]
    fn test_malformed_block() {
        let bad_cidr = "ratelimit 1 1 second {\n allowLocalIPs 10.0.0.0/99\n resources GET /\n}";
        let message = config_message(parse(bad_cidr).unwrap_err());
        assert!(message.starts_with("line 2:"), "{}", message);

        let missing_paths = "ratelimit 1 1 second {\n resources GET\n}";
        assert!(parse(missing_paths).is_err());

        let unknown = "ratelimit 1 1 second {\n resources GET /\n burst 4\n}";
        assert!(parse(unknown).is_err());

        let unclosed = "ratelimit 1 1 second {\n resources GET /\n";
        let message = config_message(parse(unclosed).unwrap_err());
        assert_eq!(message, "line 1: block is never closed");

        let no_resources = "ratelimit 1 1 second {\n allowLocalIPs 10.0.0.0/8\n}";
        assert!(parse(no_resources).is_err());
    }

    #[test]
    fn test_three_args_without_block() {
        assert!(parse("ratelimit 1 1 second").is_err());
    }

    #[test]
    fn test_unknown_directive() {
        let message = config_message(parse("gzip").unwrap_err());
        assert_eq!(message, "line 1: expected 'ratelimit', found 'gzip'");
    }
}
