//! Native functions exposed to workflows as `eea_fn_*` imports

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use eea_runtime::{
    EeaResult, GuestCall, RegisteredFunction, RegisteredFunctions, Scalar, ValueType,
};

const I32: ValueType = ValueType::I32;

fn arg(args: &[Scalar], index: usize) -> u32 {
    args.get(index).map(|a| a.as_u64() as u32).unwrap_or(0)
}

/// `eea_fn_terminal_print(str_ptr, str_len) -> i32`
fn terminal_print(call: &mut GuestCall<'_>, args: &[Scalar]) -> EeaResult<Vec<Scalar>> {
    let message = call.read_string(arg(args, 0), arg(args, 1))?;
    println!("{}", message);
    Ok(vec![Scalar::I32(0)])
}

/// `eea_fn_base64_encode(str_ptr, str_len, out_ptr, out_cap, out_len_ptr) -> i32`
///
/// Returns 1 if the encoding did not fit in `out_cap`.
fn base64_encode(call: &mut GuestCall<'_>, args: &[Scalar]) -> EeaResult<Vec<Scalar>> {
    let input = call.read_bytes(arg(args, 0), arg(args, 1))?;
    let encoded = STANDARD.encode(input);
    let written = call.write_string_and_length(&encoded, arg(args, 2), arg(args, 3), arg(args, 4))?;

    debug!(written = written.written, required = written.required, "base64 encoded");
    let code = if written.is_truncated() { 1 } else { 0 };
    Ok(vec![Scalar::I32(code)])
}

/// Table linked into every instance
pub fn functions() -> EeaResult<RegisteredFunctions> {
    RegisteredFunctions::new()
        .with(RegisteredFunction::new(
            "eea_fn_terminal_print",
            &[I32, I32],
            &[I32],
            terminal_print,
        ))?
        .with(RegisteredFunction::new(
            "eea_fn_base64_encode",
            &[I32; 5],
            &[I32],
            base64_encode,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eea_runtime::MemoryView;

    #[test]
    fn test_table() {
        let table = functions().unwrap();
        assert_eq!(
            table.names().collect::<Vec<_>>(),
            vec!["eea_fn_base64_encode", "eea_fn_terminal_print"]
        );
    }

    #[test]
    fn test_base64_encode() {
        let mut memory = vec![0u8; 256];
        memory[..5].copy_from_slice(b"hello");
        let mut call = GuestCall::new(MemoryView::new(&mut memory), "dev");

        let args = [0u32, 5, 64, 32, 128].map(|v| Scalar::I32(v as i32));
        let result = base64_encode(&mut call, &args).unwrap();
        assert_eq!(result, vec![Scalar::I32(0)]);

        assert_eq!(&memory[64..72], b"aGVsbG8=");
        assert_eq!(u32::from_le_bytes(memory[128..132].try_into().unwrap()), 8);
    }

    #[test]
    fn test_base64_encode_truncated() {
        let mut memory = vec![0u8; 256];
        let mut call = GuestCall::new(MemoryView::new(&mut memory), "dev");

        let args = [0u32, 16, 64, 4, 128].map(|v| Scalar::I32(v as i32));
        let result = base64_encode(&mut call, &args).unwrap();
        assert_eq!(result, vec![Scalar::I32(1)]);
    }
}
