// Source-like rendering of IR expressions and the sub-values shown next to
// failed guards, policies and constraints.

use itertools::Itertools;

use super::environment::Environment;
use super::evaluator::Evaluator;
use super::outcome::ResolvedValue;
use super::values::Value;
use crate::ir::{IrExpression, IrValue};

pub fn render_expression(expr: &IrExpression) -> String {
    match expr {
        IrExpression::Literal { value } => render_value(value),
        IrExpression::Identifier { name } => name.clone(),
        IrExpression::Member { object, property } => {
            format!("{}.{}", render_operand(object), property)
        }
        IrExpression::Binary {
            operator,
            left,
            right,
        } => format!("{} {} {}", render_operand(left), operator, render_operand(right)),
        IrExpression::Unary { operator, operand } => {
            if operator == "not" {
                format!("not {}", render_operand(operand))
            } else {
                format!("{}{}", operator, render_operand(operand))
            }
        }
        IrExpression::Call { callee, args } => match (callee.as_ref(), args.as_slice()) {
            (IrExpression::Identifier { name }, [target, key]) if name == "at" => {
                format!("{}[{}]", render_operand(target), render_expression(key))
            }
            _ => format!(
                "{}({})",
                render_operand(callee),
                args.iter().map(render_expression).join(", ")
            ),
        },
        IrExpression::Conditional {
            condition,
            consequent,
            alternate,
        } => format!(
            "{} ? {} : {}",
            render_operand(condition),
            render_operand(consequent),
            render_operand(alternate)
        ),
        IrExpression::Array { elements } => {
            format!("[{}]", elements.iter().map(render_expression).join(", "))
        }
        IrExpression::Object { properties } => {
            if properties.is_empty() {
                return "{}".to_string();
            }
            format!(
                "{{ {} }}",
                properties
                    .iter()
                    .map(|e| format!("{}: {}", e.key, render_expression(&e.value)))
                    .join(", ")
            )
        }
        IrExpression::Lambda { params, body } => {
            format!("({}) => {}", params.join(", "), render_expression(body))
        }
    }
}

/// Compound operands are parenthesized.
fn render_operand(expr: &IrExpression) -> String {
    match expr {
        IrExpression::Binary { .. } | IrExpression::Conditional { .. } | IrExpression::Lambda { .. } => {
            format!("({})", render_expression(expr))
        }
        _ => render_expression(expr),
    }
}

fn render_value(value: &IrValue) -> String {
    match value {
        IrValue::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        IrValue::Array(items) => format!("[{}]", items.iter().map(render_value).join(", ")),
        IrValue::Object(map) => format!(
            "{{ {} }}",
            map.iter()
                .map(|(k, v)| format!("{}: {}", k, render_value(v)))
                .join(", ")
        ),
        other => Value::from(other).to_string(),
    }
}

/// Values of every identifier, member chain and call inside `expr`, in
/// first-appearance order. Sub-expressions that fail to evaluate are left out.
pub fn resolve_sub_values(
    expr: &IrExpression,
    env: &Environment,
    evaluator: &Evaluator<'_>,
) -> Vec<ResolvedValue> {
    let mut leaves = Vec::new();
    collect_leaves(expr, &mut leaves);
    leaves
        .into_iter()
        .map(|leaf| (render_expression(leaf), leaf))
        .unique_by(|(text, _)| text.clone())
        .filter_map(|(expression, leaf)| {
            evaluator.evaluate(leaf, env).ok().map(|value| ResolvedValue {
                expression,
                value: value.to_json(),
            })
        })
        .collect()
}

fn collect_leaves<'e>(expr: &'e IrExpression, out: &mut Vec<&'e IrExpression>) {
    match expr {
        IrExpression::Literal { .. } | IrExpression::Lambda { .. } => {}
        IrExpression::Identifier { .. } | IrExpression::Member { .. } | IrExpression::Call { .. } => {
            out.push(expr)
        }
        IrExpression::Binary { left, right, .. } => {
            collect_leaves(left, out);
            collect_leaves(right, out);
        }
        IrExpression::Unary { operand, .. } => collect_leaves(operand, out),
        IrExpression::Conditional {
            condition,
            consequent,
            alternate,
        } => {
            collect_leaves(condition, out);
            collect_leaves(consequent, out);
            collect_leaves(alternate, out);
        }
        IrExpression::Array { elements } => elements.iter().for_each(|e| collect_leaves(e, out)),
        IrExpression::Object { properties } => {
            properties.iter().for_each(|e| collect_leaves(&e.value, out))
        }
    }
}

/// Key paths rooted at `user` or `context` (e.g. `user.role`), without values.
pub fn context_keys(expr: &IrExpression) -> Vec<String> {
    fn path(expr: &IrExpression) -> Option<String> {
        match expr {
            IrExpression::Identifier { name } if name == "user" || name == "context" => {
                Some(name.clone())
            }
            IrExpression::Member { object, property } => {
                path(object).map(|p| format!("{}.{}", p, property))
            }
            _ => None,
        }
    }

    fn visit(expr: &IrExpression, out: &mut Vec<String>) {
        if let Some(p) = path(expr) {
            if !out.contains(&p) {
                out.push(p);
            }
            return;
        }
        match expr {
            IrExpression::Member { object, .. } => visit(object, out),
            IrExpression::Binary { left, right, .. } => {
                visit(left, out);
                visit(right, out);
            }
            IrExpression::Unary { operand, .. } => visit(operand, out),
            IrExpression::Call { callee, args } => {
                visit(callee, out);
                args.iter().for_each(|a| visit(a, out));
            }
            IrExpression::Conditional {
                condition,
                consequent,
                alternate,
            } => {
                visit(condition, out);
                visit(consequent, out);
                visit(alternate, out);
            }
            IrExpression::Array { elements } => elements.iter().for_each(|e| visit(e, out)),
            IrExpression::Object { properties } => {
                properties.iter().for_each(|e| visit(&e.value, out))
            }
            IrExpression::Lambda { body, .. } => visit(body, out),
            IrExpression::Literal { .. } | IrExpression::Identifier { .. } => {}
        }
    }

    let mut out = Vec::new();
    visit(expr, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::compiler::lower_expression;
    use crate::parser::parse_expression;
    use crate::runtime::evaluator::Builtins;
    use serde_json::json;

    fn lower(source: &str) -> IrExpression {
        lower_expression(&parse_expression(source).unwrap())
    }

    #[test]
    fn renders_source_like_text() {
        assert_eq!(render_expression(&lower("self.amount > 0")), "self.amount > 0");
        assert_eq!(
            render_expression(&lower("(a + b) * 2")),
            "(a + b) * 2"
        );
        assert_eq!(render_expression(&lower("user.role == \"admin\"")), "user.role == \"admin\"");
        assert_eq!(render_expression(&lower("items[i]")), "items[i]");
        assert_eq!(render_expression(&lower("not done")), "not done");
    }

    #[test]
    fn resolves_leaf_values_once() {
        let builtins = Builtins::default();
        let evaluator = Evaluator::new(&builtins);
        let mut env = Environment::new();
        env.define("self", Value::from_json(&json!({"amount": -3})));
        let resolved = resolve_sub_values(&lower("self.amount > 0 and self.amount < 10"), &env, &evaluator);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].expression, "self.amount");
        assert_eq!(resolved[0].value, json!(-3));
    }

    #[test]
    fn context_keys_are_paths_not_values() {
        let keys = context_keys(&lower("user.role == \"admin\" or context.tenant.id == self.tenantId"));
        assert_eq!(keys, vec!["user.role".to_string(), "context.tenant.id".to_string()]);
    }
}
