use std::fmt::Write;

use crate::MethodInfo;

/// Format `method` the way stack traces show it: `Namespace.Type.Method(Type1 a, Type2 b)`.
pub fn format_signature(method: &MethodInfo) -> String {
    let mut signature = String::new();
    if let Some(declaring_type) = &method.declaring_type {
        signature.push_str(declaring_type);
        signature.push('.');
    }
    signature.push_str(&method.name);
    signature.push('(');
    for (i, param) in method.parameters.iter().enumerate() {
        if i > 0 {
            signature.push_str(", ");
        }
        let _ = write!(signature, "{} {}", param.type_name, param.name);
    }
    signature.push(')');
    signature
}
