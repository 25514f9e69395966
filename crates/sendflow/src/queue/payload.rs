//! Builds the provider `template` object for one queue item.
//!
//! The stored template definition is the provider's own component list
//! (`HEADER`, `BODY`, `BUTTONS`, ...) and usually carries `example` blocks
//! from template submission. Those are stripped, then each component gets
//! the `parameters` filled from the item's variables:
//!
//! - a JSON array is the positional body variables;
//! - an object may carry `header`, `body` (lists) and `buttons`
//!   (a list of lists, or an object keyed by button index);
//! - `null` means no variables.
//!
//! A media reference becomes an image parameter on the header.

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::queue::model::Template;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

#[derive(Debug, Default)]
struct Variables {
    header: Vec<String>,
    body: Vec<String>,
    buttons: Vec<(usize, Vec<String>)>,
}

pub fn build_template_payload(
    template: &Template,
    variables: &Value,
    media_ref: Option<&str>,
) -> Result<Value, PayloadError> {
    let vars = parse_variables(variables)?;
    let media_ref = media_ref.map(str::trim).filter(|m| !m.is_empty());

    let defs = match &template.components {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        _ => return Err(PayloadError("template components must be a list".into())),
    };

    let mut components = Vec::with_capacity(defs.len() + 1);
    let mut has_header = false;

    for def in defs {
        let Value::Object(mut obj) = strip_examples(def) else {
            continue;
        };
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        obj.insert("type".into(), Value::String(kind.clone()));

        match kind.as_str() {
            "header" => {
                has_header = true;
                let params = header_parameters(&vars.header, media_ref);
                if !params.is_empty() {
                    obj.insert("parameters".into(), Value::Array(params));
                }
                components.push(Value::Object(obj));
            }
            "body" => {
                if !vars.body.is_empty() {
                    obj.insert("parameters".into(), text_parameters(&vars.body));
                }
                components.push(Value::Object(obj));
            }
            "buttons" => {
                components.push(Value::Object(obj));
                for (index, values) in &vars.buttons {
                    components.push(json!({
                        "type": "button",
                        "sub_type": "url",
                        "index": index.to_string(),
                        "parameters": text_parameters(values),
                    }));
                }
            }
            _ => components.push(Value::Object(obj)),
        }
    }

    if !has_header {
        if let Some(link) = media_ref {
            components.insert(
                0,
                json!({ "type": "header", "parameters": header_parameters(&[], Some(link)) }),
            );
        }
    }

    Ok(json!({
        "name": template.name,
        "language": { "code": template.language },
        "components": components,
    }))
}

/// Removes every `example` key, at any depth.
pub fn strip_examples(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| k != "example")
                .map(|(k, v)| (k, strip_examples(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_examples).collect()),
        other => other,
    }
}

fn header_parameters(header_vars: &[String], media_ref: Option<&str>) -> Vec<Value> {
    match media_ref {
        Some(link) => vec![json!({ "type": "image", "image": { "link": link } })],
        None => header_vars
            .iter()
            .map(|v| json!({ "type": "text", "text": v }))
            .collect(),
    }
}

fn text_parameters(values: &[String]) -> Value {
    Value::Array(
        values
            .iter()
            .map(|v| json!({ "type": "text", "text": v }))
            .collect(),
    )
}

fn parse_variables(value: &Value) -> Result<Variables, PayloadError> {
    match value {
        Value::Null => Ok(Variables::default()),
        Value::Array(_) => Ok(Variables {
            body: string_list(value, "variables")?,
            ..Variables::default()
        }),
        Value::Object(map) => {
            let header = match map.get("header") {
                Some(v) => string_list(v, "header")?,
                None => Vec::new(),
            };
            let body = match map.get("body") {
                Some(v) => string_list(v, "body")?,
                None => Vec::new(),
            };
            let buttons = match map.get("buttons") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Ok((i, string_list(v, "buttons")?)))
                    .collect::<Result<Vec<_>, PayloadError>>()?
                    .into_iter()
                    .filter(|(_, v)| !v.is_empty())
                    .collect(),
                Some(Value::Object(by_index)) => {
                    let mut out = by_index
                        .iter()
                        .map(|(k, v)| {
                            let idx = k.parse::<usize>().map_err(|_| {
                                PayloadError(format!("button index `{k}` is not a number"))
                            })?;
                            Ok((idx, string_list(v, "buttons")?))
                        })
                        .collect::<Result<Vec<_>, PayloadError>>()?;
                    out.sort_by_key(|(i, _)| *i);
                    out
                }
                Some(_) => return Err(PayloadError("buttons must be a list or an object".into())),
            };
            Ok(Variables {
                header,
                body,
                buttons,
            })
        }
        _ => Err(PayloadError(
            "variables must be a list, an object or null".into(),
        )),
    }
}

fn string_list(value: &Value, field: &str) -> Result<Vec<String>, PayloadError> {
    let Value::Array(items) = value else {
        return Err(PayloadError(format!("{field} must be a list")));
    };
    items
        .iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(PayloadError(format!("{field} values must be scalars"))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template {
            name: "order_update".into(),
            language: "en_US".into(),
            components: json!([
                { "type": "HEADER", "format": "IMAGE", "example": { "header_handle": ["4::aW1n"] } },
                { "type": "BODY", "text": "Hi {{1}}, order {{2}} shipped",
                  "example": { "body_text": [["Ann", "A-1"]] } },
                { "type": "BUTTONS", "buttons": [
                    { "type": "URL", "text": "Track", "url": "https://t.example/{{1}}",
                      "example": ["https://t.example/123"] }
                ] }
            ]),
        }
    }

    fn contains_key(v: &Value, key: &str) -> bool {
        match v {
            Value::Object(m) => m.contains_key(key) || m.values().any(|x| contains_key(x, key)),
            Value::Array(a) => a.iter().any(|x| contains_key(x, key)),
            _ => false,
        }
    }

    #[test]
    fn merges_body_variables_and_header_image() {
        let out = build_template_payload(
            &template(),
            &json!(["Ann", 42]),
            Some("https://cdn.example/a.png"),
        )
        .unwrap();

        assert_eq!(out["name"], "order_update");
        assert_eq!(out["language"]["code"], "en_US");
        let comps = out["components"].as_array().unwrap();
        assert_eq!(comps[0]["type"], "header");
        assert_eq!(comps[0]["parameters"][0]["image"]["link"], "https://cdn.example/a.png");
        assert_eq!(comps[1]["type"], "body");
        assert_eq!(comps[1]["parameters"][1]["text"], "42");
        assert!(!contains_key(&out, "example"));
    }

    #[test]
    fn object_variables_fill_header_body_and_buttons() {
        let tpl = Template {
            components: json!([
                { "type": "HEADER", "format": "TEXT", "text": "Hello {{1}}" },
                { "type": "BODY", "text": "{{1}}" },
                { "type": "BUTTONS", "buttons": [] }
            ]),
            ..template()
        };
        let out = build_template_payload(
            &tpl,
            &json!({ "header": ["Ann"], "body": ["x"], "buttons": { "0": ["abc"] } }),
            None,
        )
        .unwrap();
        let comps = out["components"].as_array().unwrap();
        assert_eq!(comps[0]["parameters"][0]["text"], "Ann");
        assert_eq!(comps[1]["parameters"][0]["text"], "x");
        let button = comps.iter().find(|c| c["type"] == "button").unwrap();
        assert_eq!(button["index"], "0");
        assert_eq!(button["parameters"][0]["text"], "abc");
    }

    #[test]
    fn media_without_header_component_adds_one() {
        let tpl = Template {
            components: json!([{ "type": "BODY", "text": "plain" }]),
            ..template()
        };
        let out = build_template_payload(&tpl, &Value::Null, Some("https://m/x.jpg")).unwrap();
        let comps = out["components"].as_array().unwrap();
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0]["type"], "header");
        assert!(comps[1].get("parameters").is_none());
    }

    #[test]
    fn malformed_variables_are_rejected() {
        assert!(build_template_payload(&template(), &json!(7), None).is_err());
        assert!(build_template_payload(&template(), &json!([{"a": 1}]), None).is_err());
        assert!(build_template_payload(&template(), &json!({"buttons": {"x": []}}), None).is_err());
    }

    #[test]
    fn payload_error_converts_into_anyhow_with_its_message() {
        let err = build_template_payload(&template(), &json!(7), None).unwrap_err();
        let wrapped: anyhow::Error = err.clone().into();
        assert_eq!(wrapped.to_string(), err.0);
        assert!(wrapped.downcast_ref::<PayloadError>().is_some());
    }
}
