//! User-registered native functions
//!
//! Embedders can expose extra `env` imports to the guest on top of the core
//! host table. Each entry declares its wasm signature and a handler that sees
//! the caller's memory through the same bounds-checked view and codec the
//! core imports use. The table is built once and linked into every instance.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};
use wasmtime::{Caller, FuncType, Linker, Val, ValType};

use super::codec::{self, Encoded, Scalar, ScalarType};
use super::host::{self, CORE_IMPORTS, HostState, IMPORT_MODULE};
use super::memory::{GuestPtr, MemoryView};
use super::types::{EeaError, EeaResult};

/// Wasm value types a registered function may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    fn val_type(self) -> ValType {
        match self {
            ValueType::I32 => ValType::I32,
            ValueType::I64 => ValType::I64,
            ValueType::F32 => ValType::F32,
            ValueType::F64 => ValType::F64,
        }
    }

    fn scalar_type(self) -> ScalarType {
        match self {
            ValueType::I32 => ScalarType::I32,
            ValueType::I64 => ScalarType::I64,
            ValueType::F32 => ScalarType::F32,
            ValueType::F64 => ScalarType::F64,
        }
    }

    fn to_val(self, value: Scalar) -> Val {
        match value.cast(self.scalar_type()) {
            Scalar::I64(v) => Val::I64(v),
            Scalar::F32(v) => Val::F32(v.to_bits()),
            Scalar::F64(v) => Val::F64(v.to_bits()),
            Scalar::I32(v) => Val::I32(v),
            // cast always yields the requested variant
            _ => Val::I32(0),
        }
    }
}

fn from_val(val: &Val) -> EeaResult<Scalar> {
    match val {
        Val::I32(v) => Ok(Scalar::I32(*v)),
        Val::I64(v) => Ok(Scalar::I64(*v)),
        Val::F32(bits) => Ok(Scalar::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Scalar::F64(f64::from_bits(*bits))),
        other => Err(EeaError::Registration(format!(
            "unsupported argument type: {:?}",
            other
        ))),
    }
}

/// View of the calling guest handed to a registered handler
pub struct GuestCall<'a> {
    view: MemoryView<'a>,
    device_id: &'a str,
}

impl<'a> GuestCall<'a> {
    pub fn new(view: MemoryView<'a>, device_id: &'a str) -> Self {
        Self { view, device_id }
    }

    pub fn device_id(&self) -> &str {
        self.device_id
    }

    pub fn memory(&mut self) -> &mut MemoryView<'a> {
        &mut self.view
    }

    pub fn read_string(&self, ptr: impl Into<GuestPtr>, len: u32) -> EeaResult<String> {
        codec::decode_string(&self.view, ptr.into(), len)
    }

    pub fn read_bytes(&self, ptr: impl Into<GuestPtr>, len: u32) -> EeaResult<Vec<u8>> {
        Ok(self.view.read(ptr.into(), len)?.to_vec())
    }

    pub fn read_scalar(&self, ptr: impl Into<GuestPtr>, ty: ScalarType) -> EeaResult<Scalar> {
        codec::decode_scalar(&self.view, ptr.into(), ty)
    }

    pub fn write_scalar(
        &mut self,
        value: impl Into<Scalar>,
        ptr: impl Into<GuestPtr>,
        ty: ScalarType,
    ) -> EeaResult<()> {
        codec::encode_scalar(&mut self.view, value, ptr.into(), ty)
    }

    /// Write `s` truncated to `capacity`, with its byte count as `u32` at `len_ptr`
    pub fn write_string_and_length(
        &mut self,
        s: &str,
        ptr: impl Into<GuestPtr>,
        capacity: u32,
        len_ptr: impl Into<GuestPtr>,
    ) -> EeaResult<Encoded> {
        codec::encode_string_and_length(
            &mut self.view,
            s,
            ptr.into(),
            capacity,
            len_ptr.into(),
            ScalarType::U32,
        )
    }
}

/// Native handler behind a registered function
pub type NativeHandler =
    Arc<dyn Fn(&mut GuestCall<'_>, &[Scalar]) -> EeaResult<Vec<Scalar>> + Send + Sync>;

/// One registered import
#[derive(Clone)]
pub struct RegisteredFunction {
    pub name: String,
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
    handler: NativeHandler,
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("results", &self.results)
            .finish()
    }
}

impl RegisteredFunction {
    pub fn new<F>(
        name: impl Into<String>,
        params: &[ValueType],
        results: &[ValueType],
        handler: F,
    ) -> Self
    where
        F: Fn(&mut GuestCall<'_>, &[Scalar]) -> EeaResult<Vec<Scalar>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.to_vec(),
            results: results.to_vec(),
            handler: Arc::new(handler),
        }
    }

    fn invoke(
        &self,
        caller: &mut Caller<'_, HostState>,
        params: &[Val],
        results: &mut [Val],
    ) -> EeaResult<()> {
        let args = params.iter().map(from_val).collect::<EeaResult<Vec<_>>>()?;

        let memory = host::guest_memory(caller)?;
        let (data, state) = memory.data_and_store_mut(caller);
        let mut call = GuestCall::new(MemoryView::new(data), &state.device_id);
        let returned = (self.handler)(&mut call, &args)?;

        if returned.len() != self.results.len() {
            return Err(EeaError::Registration(format!(
                "{} returned {} values, expected {}",
                self.name,
                returned.len(),
                self.results.len()
            )));
        }
        for ((slot, ty), value) in results.iter_mut().zip(&self.results).zip(returned) {
            *slot = ty.to_val(value);
        }
        Ok(())
    }
}

/// Capability table of registered functions, keyed by import name
#[derive(Debug, Clone, Default)]
pub struct RegisteredFunctions {
    functions: BTreeMap<String, RegisteredFunction>,
}

impl RegisteredFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; core import names and duplicates are rejected
    pub fn register(&mut self, function: RegisteredFunction) -> EeaResult<()> {
        if CORE_IMPORTS.contains(&function.name.as_str()) {
            return Err(EeaError::Registration(format!(
                "{} collides with a core host import",
                function.name
            )));
        }
        if self.functions.contains_key(&function.name) {
            return Err(EeaError::Registration(format!(
                "{} is already registered",
                function.name
            )));
        }

        debug!(name = %function.name, "Registered native function");
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    pub fn with(mut self, function: RegisteredFunction) -> EeaResult<Self> {
        self.register(function)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Define every entry on `linker` under module `env`
    pub fn link(&self, linker: &mut Linker<HostState>) -> EeaResult<()> {
        for function in self.functions.values() {
            let ty = FuncType::new(
                linker.engine(),
                function.params.iter().map(|p| p.val_type()),
                function.results.iter().map(|r| r.val_type()),
            );
            let entry = function.clone();

            linker
                .func_new(
                    IMPORT_MODULE,
                    &function.name,
                    ty,
                    move |mut caller, params, results| {
                        entry.invoke(&mut caller, params, results).map_err(|e| {
                            error!(name = %entry.name, error = %e, "Registered function failed");
                            wasmtime::Error::msg(e.to_string())
                        })
                    },
                )
                .map_err(|e| EeaError::Registration(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> RegisteredFunction {
        RegisteredFunction::new("eea_fn_noop", &[], &[ValueType::I32], |_, _| {
            Ok(vec![Scalar::I32(0)])
        })
    }

    #[test]
    fn test_rejects_core_names_and_duplicates() {
        let mut table = RegisteredFunctions::new();
        let clash = RegisteredFunction::new("eea_send_message", &[], &[], |_, _| Ok(vec![]));
        assert!(matches!(
            table.register(clash),
            Err(EeaError::Registration(_))
        ));

        table.register(noop()).unwrap();
        assert!(table.register(noop()).is_err());
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["eea_fn_noop"]);
    }

    #[test]
    fn test_guest_call_helpers() {
        let mut mem = vec![0u8; 64];
        mem[0..2].copy_from_slice(b"hi");
        let mut call = GuestCall::new(MemoryView::new(&mut mem), "dev");

        assert_eq!(call.read_string(0u32, 2).unwrap(), "hi");
        let encoded = call.write_string_and_length("aGk=", 8u32, 16, 32u32).unwrap();
        assert_eq!(encoded.written, 4);
        assert_eq!(call.read_scalar(32u32, ScalarType::U32).unwrap(), Scalar::U32(4));
        assert_eq!(call.device_id(), "dev");
    }

    #[test]
    fn test_value_conversion() {
        assert!(matches!(ValueType::F32.to_val(Scalar::I32(2)), Val::F32(bits) if f32::from_bits(bits) == 2.0));
        assert!(matches!(ValueType::I32.to_val(Scalar::F64(-3.7)), Val::I32(-3)));
        assert_eq!(from_val(&Val::I64(9)).unwrap(), Scalar::I64(9));
    }
}
