// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! JIT trampoline builder.
//!
//! Allocates raw executable memory directly via `libc`: allocate with
//! `mmap`, write machine code, flip to executable with `mprotect`.
//!
//! Each trampoline is a small, fully self-contained stub: the method
//! pointer, user-data pointer, and callback address are baked into the
//! code as 64-bit immediates (`movabs`) rather than read from a
//! relocatable data section, since all three are already fixed by the
//! time code generation runs and the stub never needs to be position-
//! independent beyond that.
//!
//! Scope: scalar and pointer parameter/return shapes (bool, char8/16, the
//! signed/unsigned integer family, float, double, pointer) plus
//! by-reference parameters of any type, on the x86_64 System V and
//! Windows x64 ABIs. Vector/matrix aggregate return and parameter shapes
//! require multi-register or hidden-pointer return marshalling this build
//! does not yet implement; `Method::validate` accepts them as manifest
//! data, but requesting a trampoline for one yields
//! `JitError::UnsupportedParameterShape` rather than publishing a partial
//! function.
//!
//! There is no standalone `Trampoline` type: a trampoline is the raw code
//! pointer `build_trampoline` returns, and its backing page lives inside
//! `JitRuntime` for as long as the runtime itself does, so "trampolines
//! are owned by the JIT runtime" falls out of that directly rather than
//! needing a handle type to enforce it.

use std::ffi::c_void;
use std::sync::Mutex;

use crate::error::JitError;
use crate::types::{Method, ValueType};

/// One argument or return slot, pointer-sized, carrying either an integer,
/// a float/double bit pattern, or a pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub union Slot {
    pub integer: u64,
    pub float: f64,
    pub pointer: *mut c_void,
}

impl Slot {
    pub fn from_i64(v: i64) -> Self {
        Slot { integer: v as u64 }
    }

    pub fn from_f64(v: f64) -> Self {
        Slot { float: v }
    }

    /// # Safety
    /// The caller must know which union member was last written.
    pub unsafe fn as_i64(&self) -> i64 {
        self.integer as i64
    }

    /// # Safety
    /// The caller must know which union member was last written.
    pub unsafe fn as_f64(&self) -> f64 {
        self.float
    }
}

/// Host callback shape invoked by every generated trampoline.
pub type HostCallback =
    unsafe extern "C" fn(method: *const Method, user_data: *mut c_void, args: *const Slot, arg_count: u8, ret: *mut Slot);

#[derive(Clone, Copy, PartialEq, Eq)]
enum ArgClass {
    Integer,
    Float,
}

fn classify(value_type: ValueType, by_reference: bool) -> Result<ArgClass, JitError> {
    if by_reference {
        return Ok(ArgClass::Integer);
    }
    match value_type {
        ValueType::Float | ValueType::Double => Ok(ArgClass::Float),
        ValueType::Void
        | ValueType::Bool
        | ValueType::Char8
        | ValueType::Char16
        | ValueType::Int8
        | ValueType::Int16
        | ValueType::Int32
        | ValueType::Int64
        | ValueType::UInt8
        | ValueType::UInt16
        | ValueType::UInt32
        | ValueType::UInt64
        | ValueType::Pointer
        | ValueType::String => Ok(ArgClass::Integer),
        other => Err(JitError::UnsupportedParameterShape(other)),
    }
}

/// One page of executable memory holding a single trampoline's code.
struct ExecutablePage {
    ptr: *mut c_void,
    len: usize,
}

unsafe impl Send for ExecutablePage {}

impl Drop for ExecutablePage {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
        #[cfg(windows)]
        unsafe {
            windows_sys::Win32::System::Memory::VirtualFree(self.ptr, 0, windows_sys::Win32::System::Memory::MEM_RELEASE);
        }
    }
}

impl ExecutablePage {
    #[cfg(unix)]
    fn allocate(len: usize) -> Result<Self, JitError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let rounded = len.div_ceil(page_size) * page_size;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::AllocationFailed(std::io::Error::last_os_error().to_string()));
        }
        Ok(Self { ptr, len: rounded })
    }

    #[cfg(windows)]
    fn allocate(len: usize) -> Result<Self, JitError> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

        let ptr = unsafe { VirtualAlloc(std::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(JitError::AllocationFailed("VirtualAlloc failed".to_string()));
        }
        Ok(Self { ptr, len })
    }

    #[cfg(unix)]
    fn make_executable(&self) -> Result<(), JitError> {
        let result = unsafe { libc::mprotect(self.ptr, self.len, libc::PROT_READ | libc::PROT_EXEC) };
        if result != 0 {
            return Err(JitError::ProtectionFailed(std::io::Error::last_os_error().to_string()));
        }
        Ok(())
    }

    #[cfg(windows)]
    fn make_executable(&self) -> Result<(), JitError> {
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};

        let mut old_protect = 0u32;
        let ok = unsafe { VirtualProtect(self.ptr, self.len, PAGE_EXECUTE_READ, &mut old_protect) };
        if ok == 0 {
            return Err(JitError::ProtectionFailed("VirtualProtect failed".to_string()));
        }
        Ok(())
    }

    unsafe fn write(&self, bytes: &[u8]) {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr as *mut u8, bytes.len());
    }
}

/// Process-wide JIT state. Explicit init on first request and explicit
/// teardown at host shutdown rather than a hidden global; the orchestrator
/// owns one instance and drops it after every plugin has unloaded.
pub struct JitRuntime {
    trampolines: Mutex<Vec<(Box<Method>, ExecutablePage)>>,
}

impl JitRuntime {
    pub fn new() -> Self {
        Self { trampolines: Mutex::new(Vec::new()) }
    }

    /// Builds a native trampoline for `method`, calling `callback` with
    /// `user_data` on every invocation. The returned pointer is valid
    /// until `self` is dropped.
    ///
    /// The calling convention named in `method.calling_convention` only
    /// changes code generation on Windows, where `stdcall`/`fastcall`/
    /// `thiscall`/`vectorcall` are real distinct ABIs; on x86_64 System V
    /// the legacy convention names collapse onto the single platform ABI,
    /// so non-Windows builds always emit the SysV sequence regardless of
    /// the string: non-Windows targets have only one native ABI, so
    /// there's nothing for the declared convention to select between.
    pub fn build_trampoline(
        &self,
        method: Method,
        callback: HostCallback,
        user_data: *mut c_void,
    ) -> Result<*const (), JitError> {
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (method, callback, user_data);
            return Err(JitError::UnsupportedArchitecture);
        }

        #[cfg(target_arch = "x86_64")]
        {
            let method = Box::new(method);

            let mut params = Vec::with_capacity(method.parameters.len());
            for p in &method.parameters {
                params.push(classify(p.value_type, p.by_reference)?);
            }
            let ret_class = if method.return_type.value_type == ValueType::Void {
                None
            } else {
                Some(classify(method.return_type.value_type, method.return_type.by_reference)?)
            };

            let method_ptr = method.as_ref() as *const Method;
            let ctx = x86_64::TrampolineContext { method: method_ptr, user_data, callback };

            let code = if cfg!(windows) {
                x86_64::emit_win64(&params, ret_class, &ctx)?
            } else {
                x86_64::emit_sysv(&params, ret_class, &ctx)?
            };

            let page = ExecutablePage::allocate(code.len())?;
            unsafe {
                page.write(&code);
            }
            page.make_executable()?;
            let entry = page.ptr as *const ();

            let mut trampolines = self.trampolines.lock().expect("jit runtime mutex poisoned");
            trampolines.push((method, page));

            Ok(entry)
        }
    }

    pub fn trampoline_count(&self) -> usize {
        self.trampolines.lock().expect("jit runtime mutex poisoned").len()
    }
}

impl Default for JitRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    use super::ArgClass;
    use crate::error::JitError;
    use crate::jit::HostCallback;
    use crate::types::Method;
    use std::ffi::c_void;

    const SYSV_INT_REGS: [u8; 6] = [7, 6, 2, 1, 8, 9]; // rdi, rsi, rdx, rcx, r8, r9
    const WIN64_INT_REGS: [u8; 4] = [1, 2, 8, 9]; // rcx, rdx, r8, r9

    /// Everything baked into a trampoline as immediates.
    pub(super) struct TrampolineContext {
        pub method: *const Method,
        pub user_data: *mut c_void,
        pub callback: HostCallback,
    }

    fn mov_store(buf: &mut Vec<u8>, src_reg: u8, disp: i8) {
        let rex = 0x48 | if src_reg >= 8 { 0x04 } else { 0x00 };
        buf.push(rex);
        buf.push(0x89);
        buf.push(0b01_000_101 | ((src_reg & 7) << 3));
        buf.push(disp as u8);
    }

    fn movsd_store(buf: &mut Vec<u8>, xmm: u8, disp: i8) {
        buf.extend_from_slice(&[0xF2, 0x0F, 0x11]);
        buf.push(0b01_000_101 | ((xmm & 7) << 3));
        buf.push(disp as u8);
    }

    fn movsd_load_xmm0(buf: &mut Vec<u8>, disp: i8) {
        buf.extend_from_slice(&[0xF2, 0x0F, 0x10, 0b01_000_101, disp as u8]);
    }

    fn mov_load_rax(buf: &mut Vec<u8>, disp: i8) {
        buf.extend_from_slice(&[0x48, 0x8B, 0b01_000_101, disp as u8]);
    }

    fn movabs(buf: &mut Vec<u8>, reg: u8, imm: u64) {
        let rex = 0x48 | if reg >= 8 { 0x01 } else { 0x00 };
        buf.push(rex);
        buf.push(0xB8 + (reg & 7));
        buf.extend_from_slice(&imm.to_le_bytes());
    }

    fn lea_from_rbp(buf: &mut Vec<u8>, dst_reg: u8, disp: i8) {
        let rex = 0x48 | if dst_reg >= 8 { 0x04 } else { 0x00 };
        buf.push(rex);
        buf.push(0x8D);
        buf.push(0b01_000_101 | ((dst_reg & 7) << 3));
        buf.push(disp as u8);
    }

    /// Emits `mov e<reg>, imm32`, which zero-extends into the full
    /// 64-bit register per x86_64 semantics.
    fn mov_imm32(buf: &mut Vec<u8>, reg: u8, imm: u32) {
        if reg >= 8 {
            buf.push(0x41);
        }
        buf.push(0xB8 + (reg & 7));
        buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `[rbp+argbuf_disp .. argbuf_disp+8*n)` holds the packed argument
    /// buffer (index 0 first); `[rbp+retbuf_disp .. retbuf_disp+16)`
    /// holds the two-slot return buffer.
    struct Frame {
        frame_size: i32,
        argbuf_disp: i8,
        retbuf_disp: i8,
    }

    fn layout(arg_count: usize, extra_reserve: i32) -> Result<Frame, JitError> {
        let argbuf_bytes = (arg_count.max(1) * 8) as i32;
        let retbuf_bytes = 16;
        let raw = argbuf_bytes + retbuf_bytes + extra_reserve;
        let frame_size = (raw + 15) & !15;
        if frame_size > 120 {
            return Err(JitError::UnsupportedParameterShape(crate::types::ValueType::Any));
        }
        Ok(Frame {
            frame_size,
            argbuf_disp: -frame_size as i8,
            retbuf_disp: (-frame_size + argbuf_bytes) as i8,
        })
    }

    fn emit_prologue(buf: &mut Vec<u8>, frame_size: i32) {
        buf.push(0x55); // push rbp
        buf.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        buf.extend_from_slice(&[0x48, 0x83, 0xEC, frame_size as u8]); // sub rsp, frame_size
    }

    fn emit_epilogue(buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[0x48, 0x89, 0xEC]); // mov rsp, rbp
        buf.push(0x5D); // pop rbp
        buf.push(0xC3); // ret
    }

    fn emit_return_unpack(buf: &mut Vec<u8>, ret_class: Option<ArgClass>, retbuf_disp: i8) {
        match ret_class {
            None => {}
            Some(ArgClass::Integer) => mov_load_rax(buf, retbuf_disp),
            Some(ArgClass::Float) => movsd_load_xmm0(buf, retbuf_disp),
        }
    }

    pub(super) fn emit_sysv(params: &[ArgClass], ret_class: Option<ArgClass>, ctx: &TrampolineContext) -> Result<Vec<u8>, JitError> {
        if params.len() > 6 || params.iter().filter(|c| matches!(c, ArgClass::Float)).count() > 8 {
            return Err(JitError::UnsupportedParameterShape(crate::types::ValueType::Any));
        }
        let frame = layout(params.len(), 0)?;
        let mut buf = Vec::with_capacity(96);

        emit_prologue(&mut buf, frame.frame_size);

        let mut int_idx = 0usize;
        let mut float_idx = 0u8;
        for (i, class) in params.iter().enumerate() {
            let slot_disp = frame.argbuf_disp + (i as i32 * 8) as i8;
            match class {
                ArgClass::Integer => {
                    mov_store(&mut buf, SYSV_INT_REGS[int_idx], slot_disp);
                    int_idx += 1;
                }
                ArgClass::Float => {
                    movsd_store(&mut buf, float_idx, slot_disp);
                    float_idx += 1;
                }
            }
        }

        movabs(&mut buf, 7, ctx.method as u64); // rdi = method
        movabs(&mut buf, 6, ctx.user_data as u64); // rsi = user_data
        lea_from_rbp(&mut buf, 2, frame.argbuf_disp); // rdx = &argbuf
        mov_imm32(&mut buf, 1, params.len() as u32); // ecx = arg_count
        lea_from_rbp(&mut buf, 8, frame.retbuf_disp); // r8 = &retbuf
        movabs(&mut buf, 0, ctx.callback as usize as u64); // rax = callback
        buf.extend_from_slice(&[0xFF, 0xD0]); // call rax

        emit_return_unpack(&mut buf, ret_class, frame.retbuf_disp);
        emit_epilogue(&mut buf);
        Ok(buf)
    }

    pub(super) fn emit_win64(params: &[ArgClass], ret_class: Option<ArgClass>, ctx: &TrampolineContext) -> Result<Vec<u8>, JitError> {
        if params.len() > 4 {
            return Err(JitError::UnsupportedParameterShape(crate::types::ValueType::Any));
        }
        // 32 bytes of shadow space the callee (our host callback) is
        // entitled to below its return address, reserved on top of our
        // own frame.
        let frame = layout(params.len(), 32)?;
        let mut buf = Vec::with_capacity(96);

        emit_prologue(&mut buf, frame.frame_size);

        for (i, class) in params.iter().enumerate() {
            let slot_disp = frame.argbuf_disp + (i as i32 * 8) as i8;
            match class {
                ArgClass::Integer => mov_store(&mut buf, WIN64_INT_REGS[i], slot_disp),
                ArgClass::Float => movsd_store(&mut buf, i as u8, slot_disp),
            }
        }

        movabs(&mut buf, 1, ctx.method as u64); // rcx = method
        movabs(&mut buf, 2, ctx.user_data as u64); // rdx = user_data
        lea_from_rbp(&mut buf, 8, frame.argbuf_disp); // r8 = &argbuf
        mov_imm32(&mut buf, 9, params.len() as u32); // r9d = arg_count

        // The fifth argument (&retbuf) goes on the stack per the Win64
        // convention (only the first four arguments get registers);
        // store it at the bottom of our reserved shadow space, just
        // above where the callee would itself spill rcx/rdx/r8/r9.
        lea_from_rbp(&mut buf, 0, frame.retbuf_disp); // rax = &retbuf (scratch)
        buf.extend_from_slice(&[0x48, 0x89, 0x44, 0x24, 0x20]); // mov [rsp+0x20], rax

        movabs(&mut buf, 0, ctx.callback as usize as u64); // rax = callback
        buf.extend_from_slice(&[0xFF, 0xD0]); // call rax

        emit_return_unpack(&mut buf, ret_class, frame.retbuf_disp);
        emit_epilogue(&mut buf);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Property;

    extern "C" fn identity_callback(_method: *const Method, _user_data: *mut c_void, args: *const Slot, arg_count: u8, ret: *mut Slot) {
        unsafe {
            if arg_count >= 1 {
                (*ret).integer = (*args).integer;
            }
        }
    }

    #[test]
    fn classify_rejects_unsupported_aggregate() {
        let err = classify(ValueType::Vector3, false).unwrap_err();
        assert!(matches!(err, JitError::UnsupportedParameterShape(ValueType::Vector3)));
    }

    #[test]
    fn classify_treats_by_reference_as_integer() {
        assert!(matches!(classify(ValueType::Double, true), Ok(ArgClass::Integer)));
    }

    #[test]
    fn classify_treats_float_as_float_class() {
        assert!(matches!(classify(ValueType::Float, false), Ok(ArgClass::Float)));
    }

    #[test]
    fn runtime_builds_and_counts_a_trampoline() {
        let runtime = JitRuntime::new();
        let method = Method::new("add", "add", Property::new(ValueType::Int32));
        let result = runtime.build_trampoline(method, identity_callback, std::ptr::null_mut());
        if cfg!(target_arch = "x86_64") {
            assert!(result.is_ok());
            assert_eq!(runtime.trampoline_count(), 1);
        } else {
            assert!(matches!(result, Err(JitError::UnsupportedArchitecture)));
        }
    }

    #[test]
    fn too_many_integer_parameters_is_rejected_on_sysv() {
        let mut method = Method::new("f", "f", Property::new(ValueType::Void));
        for _ in 0..8 {
            method.parameters.push(Property::new(ValueType::Int32));
        }
        let runtime = JitRuntime::new();
        let result = runtime.build_trampoline(method, identity_callback, std::ptr::null_mut());
        if cfg!(target_arch = "x86_64") && !cfg!(windows) {
            assert!(result.is_err());
        }
    }

    #[test]
    fn vector_return_type_is_rejected_rather_than_published_partially() {
        let method = Method::new("f", "f", Property::new(ValueType::Vector4));
        let runtime = JitRuntime::new();
        let result = runtime.build_trampoline(method, identity_callback, std::ptr::null_mut());
        assert!(result.is_err());
    }

    extern "C" fn add_callback(_method: *const Method, _user_data: *mut c_void, args: *const Slot, arg_count: u8, ret: *mut Slot) {
        assert_eq!(arg_count, 2);
        unsafe {
            let a = (*args.add(0)).integer as i32;
            let b = (*args.add(1)).integer as i32;
            (*ret).integer = (a + b) as u64;
        }
    }

    /// `int add(int a, int b)` called through the generated trampoline
    /// returns the same value a direct call to the callback would, with
    /// `arg_count == 2`.
    #[test]
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    fn trampoline_call_matches_direct_callback_invocation() {
        let mut method = Method::new("add", "add", Property::new(ValueType::Int32));
        method.parameters.push(Property::new(ValueType::Int32));
        method.parameters.push(Property::new(ValueType::Int32));

        let runtime = JitRuntime::new();
        let entry = runtime.build_trampoline(method, add_callback, std::ptr::null_mut()).unwrap();

        let native: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(native(3, 4), 7);
    }

    static BY_REF_WRITTEN: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(0);

    extern "C" fn write_through_callback(_method: *const Method, _user_data: *mut c_void, args: *const Slot, arg_count: u8, _ret: *mut Slot) {
        assert_eq!(arg_count, 1);
        unsafe {
            let ptr = (*args).pointer as *mut i32;
            *ptr = 42;
        }
        BY_REF_WRITTEN.store(42, std::sync::atomic::Ordering::SeqCst);
    }

    /// A by-reference first parameter lets the host callback write
    /// through the caller's own variable.
    #[test]
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    fn by_reference_parameter_lets_callback_mutate_callers_variable() {
        let mut method = Method::new("set", "set", Property::new(ValueType::Void));
        method.parameters.push(Property::new(ValueType::Int32).by_reference());

        let runtime = JitRuntime::new();
        let entry = runtime.build_trampoline(method, write_through_callback, std::ptr::null_mut()).unwrap();

        let native: extern "C" fn(*mut i32) = unsafe { std::mem::transmute(entry) };
        let mut value: i32 = 0;
        native(&mut value as *mut i32);
        assert_eq!(value, 42);
    }
}
