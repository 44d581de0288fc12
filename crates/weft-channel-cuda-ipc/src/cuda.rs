//! CUDA 驱动 API 的薄封装。
//!
//! # 模块定位（Why）
//! - 通道状态机只关心"记录事件、等待事件、打开句柄、发起拷贝"这几个动词；
//!   全部裸调用与 `CUresult` 判读收拢在这里，状态机侧不出现任何 `unsafe`。
//! - 驱动错误统一映射为 `device.driver` 错误码并标注失败的调用名，
//!   与传输层 I/O 错误的映射手法保持一致。
//!
//! # 实现策略（How）
//! - 经 `cudarc` 的动态加载绑定触达驱动符号，进程内按需完成一次 `cuInit`；
//! - 设备当前上下文使用主上下文（retain 一次、按设备缓存、析构时释放），
//!   每个驱动调用都在对应设备的上下文压栈守卫内执行；
//! - 事件一律以跨进程 + 关闭计时的标志创建，IPC 句柄在创建时即序列化，
//!   后续动作不再有可失败的序列化步骤。

use std::sync::{Arc, OnceLock};

use cudarc::driver::sys;

use weft_core::{codes, WeftError};

/// 驱动侧 IPC 句柄的固定尺寸（事件句柄与显存句柄一致）。
pub(crate) const IPC_HANDLE_LEN: usize = 64;

fn driver_error(op: &'static str, status: sys::CUresult) -> WeftError {
    WeftError::new(
        codes::DEVICE_DRIVER,
        format!("driver call `{op}` failed with {status:?}"),
    )
}

fn check(op: &'static str, status: sys::CUresult) -> Result<(), WeftError> {
    if status == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(driver_error(op, status))
    }
}

static DRIVER_INIT: OnceLock<Result<(), WeftError>> = OnceLock::new();

/// 进程内恰好一次的驱动初始化。
pub(crate) fn ensure_initialized() -> Result<(), WeftError> {
    DRIVER_INIT
        .get_or_init(|| unsafe { check("cuInit", (sys::culib().cuInit)(0)) })
        .clone()
}

/// 某个设备的主上下文：retain 一次、随通道上下文存活。
pub(crate) struct PrimaryContext {
    device: sys::CUdevice,
    raw: sys::CUcontext,
    ordinal: i32,
}

unsafe impl Send for PrimaryContext {}
unsafe impl Sync for PrimaryContext {}

impl PrimaryContext {
    pub(crate) fn retain(ordinal: i32) -> Result<Arc<Self>, WeftError> {
        ensure_initialized()?;
        unsafe {
            let mut device: sys::CUdevice = 0;
            check("cuDeviceGet", (sys::culib().cuDeviceGet)(&mut device, ordinal))?;
            let mut raw: sys::CUcontext = std::ptr::null_mut();
            check(
                "cuDevicePrimaryCtxRetain",
                (sys::culib().cuDevicePrimaryCtxRetain)(&mut raw, device),
            )?;
            Ok(Arc::new(Self {
                device,
                raw,
                ordinal,
            }))
        }
    }

    pub(crate) fn ordinal(&self) -> i32 {
        self.ordinal
    }

    /// 在该设备的上下文内执行一个驱动调用序列。
    pub(crate) fn with_current<R>(
        &self,
        body: impl FnOnce() -> Result<R, WeftError>,
    ) -> Result<R, WeftError> {
        unsafe {
            check(
                "cuCtxPushCurrent",
                (sys::culib().cuCtxPushCurrent_v2)(self.raw),
            )?;
        }
        let result = body();
        unsafe {
            let mut popped: sys::CUcontext = std::ptr::null_mut();
            let _ = (sys::culib().cuCtxPopCurrent_v2)(&mut popped);
        }
        result
    }
}

impl Drop for PrimaryContext {
    fn drop(&mut self) {
        unsafe {
            let _ = (sys::culib().cuDevicePrimaryCtxRelease_v2)(self.device);
        }
    }
}

/// 用户流的跨线程搬运壳：设备流句柄在进程内全局有效。
#[derive(Clone, Copy, Debug)]
pub struct CudaStream(sys::CUstream);

unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}

impl CudaStream {
    /// 由裸流句柄构造；调用方保证句柄在操作完成前有效。
    pub fn from_raw(raw: sys::CUstream) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(&self) -> sys::CUstream {
        self.0
    }
}

/// 设备事件：跨进程、关闭计时，IPC 句柄在创建时序列化。
pub(crate) struct CudaEvent {
    raw: sys::CUevent,
    context: Arc<PrimaryContext>,
    ipc_handle: [u8; IPC_HANDLE_LEN],
}

unsafe impl Send for CudaEvent {}
unsafe impl Sync for CudaEvent {}

impl CudaEvent {
    /// 创建一个可跨进程共享的事件并序列化其 IPC 句柄。
    pub(crate) fn new_interprocess(context: Arc<PrimaryContext>) -> Result<Self, WeftError> {
        context.with_current(|| unsafe {
            let flags = sys::CUevent_flags_enum::CU_EVENT_DISABLE_TIMING as u32
                | sys::CUevent_flags_enum::CU_EVENT_INTERPROCESS as u32;
            let mut raw: sys::CUevent = std::ptr::null_mut();
            check("cuEventCreate", (sys::culib().cuEventCreate)(&mut raw, flags))?;

            let mut handle: sys::CUipcEventHandle = std::mem::zeroed();
            let status = (sys::culib().cuIpcGetEventHandle)(&mut handle, raw);
            if status != sys::CUresult::CUDA_SUCCESS {
                let _ = (sys::culib().cuEventDestroy_v2)(raw);
                return Err(driver_error("cuIpcGetEventHandle", status));
            }
            let mut ipc_handle = [0u8; IPC_HANDLE_LEN];
            for (dst, src) in ipc_handle.iter_mut().zip(handle.reserved.iter()) {
                *dst = *src as u8;
            }
            Ok(Self {
                raw,
                context: Arc::clone(&context),
                ipc_handle,
            })
        })
    }

    /// 从对端转交的 IPC 句柄重建事件。
    pub(crate) fn open(
        context: Arc<PrimaryContext>,
        serialized: &[u8],
    ) -> Result<Self, WeftError> {
        if serialized.len() != IPC_HANDLE_LEN {
            return Err(WeftError::new(
                codes::PROTOCOL_DECODE,
                format!(
                    "event ipc handle must be {IPC_HANDLE_LEN} bytes, got {}",
                    serialized.len()
                ),
            ));
        }
        context.with_current(|| unsafe {
            let mut handle: sys::CUipcEventHandle = std::mem::zeroed();
            for (dst, src) in handle.reserved.iter_mut().zip(serialized.iter()) {
                *dst = *src as _;
            }
            let mut raw: sys::CUevent = std::ptr::null_mut();
            check(
                "cuIpcOpenEventHandle",
                (sys::culib().cuIpcOpenEventHandle)(&mut raw, handle),
            )?;
            let mut ipc_handle = [0u8; IPC_HANDLE_LEN];
            ipc_handle.copy_from_slice(serialized);
            Ok(Self {
                raw,
                context: Arc::clone(&context),
                ipc_handle,
            })
        })
    }

    /// 事件的序列化 IPC 句柄。
    pub(crate) fn serialized_handle(&self) -> &[u8; IPC_HANDLE_LEN] {
        &self.ipc_handle
    }

    /// 在给定流上记录事件。
    pub(crate) fn record(&self, stream: CudaStream) -> Result<(), WeftError> {
        self.context.with_current(|| unsafe {
            check("cuEventRecord", (sys::culib().cuEventRecord)(self.raw, stream.raw()))
        })
    }

    /// 让给定流等待事件完成。
    pub(crate) fn wait(&self, stream: CudaStream) -> Result<(), WeftError> {
        self.context.with_current(|| unsafe {
            check(
                "cuStreamWaitEvent",
                (sys::culib().cuStreamWaitEvent)(stream.raw(), self.raw, 0),
            )
        })
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        let _ = self.context.with_current(|| unsafe {
            check("cuEventDestroy", (sys::culib().cuEventDestroy_v2)(self.raw))
        });
    }
}

/// 指针所在的设备序号。
pub(crate) fn device_for_pointer(ptr: u64) -> Result<i32, WeftError> {
    ensure_initialized()?;
    unsafe {
        let mut ordinal: i32 = 0;
        check(
            "cuPointerGetAttribute",
            (sys::culib().cuPointerGetAttribute)(
                (&mut ordinal as *mut i32).cast(),
                sys::CUpointer_attribute_enum::CU_POINTER_ATTRIBUTE_DEVICE_ORDINAL,
                ptr,
            ),
        )?;
        Ok(ordinal)
    }
}

/// 基址分配的稳定标识。
pub(crate) fn buffer_id(context: &PrimaryContext, ptr: u64) -> Result<u64, WeftError> {
    context.with_current(|| unsafe {
        let mut id: u64 = 0;
        check(
            "cuPointerGetAttribute",
            (sys::culib().cuPointerGetAttribute)(
                (&mut id as *mut u64).cast(),
                sys::CUpointer_attribute_enum::CU_POINTER_ATTRIBUTE_BUFFER_ID,
                ptr,
            ),
        )?;
        Ok(id)
    })
}

/// 指针所属分配的基址与长度。
pub(crate) fn address_range(context: &PrimaryContext, ptr: u64) -> Result<(u64, usize), WeftError> {
    context.with_current(|| unsafe {
        let mut base: sys::CUdeviceptr = 0;
        let mut size: usize = 0;
        check(
            "cuMemGetAddressRange",
            (sys::culib().cuMemGetAddressRange_v2)(&mut base, &mut size, ptr),
        )?;
        Ok((base, size))
    })
}

/// 打开指针所属分配的显存 IPC 句柄。
pub(crate) fn ipc_mem_handle(
    context: &PrimaryContext,
    ptr: u64,
) -> Result<[u8; IPC_HANDLE_LEN], WeftError> {
    context.with_current(|| unsafe {
        let mut handle: sys::CUipcMemHandle = std::mem::zeroed();
        check(
            "cuIpcGetMemHandle",
            (sys::culib().cuIpcGetMemHandle)(&mut handle, ptr),
        )?;
        let mut bytes = [0u8; IPC_HANDLE_LEN];
        for (dst, src) in bytes.iter_mut().zip(handle.reserved.iter()) {
            *dst = *src as u8;
        }
        Ok(bytes)
    })
}

/// 打开对端的显存 IPC 句柄，返回本进程内可用的基址。
pub(crate) fn open_ipc_mem_handle(
    context: &PrimaryContext,
    serialized: &[u8],
) -> Result<u64, WeftError> {
    if serialized.len() != IPC_HANDLE_LEN {
        return Err(WeftError::new(
            codes::PROTOCOL_DECODE,
            format!(
                "memory ipc handle must be {IPC_HANDLE_LEN} bytes, got {}",
                serialized.len()
            ),
        ));
    }
    context.with_current(|| unsafe {
        let mut handle: sys::CUipcMemHandle = std::mem::zeroed();
        for (dst, src) in handle.reserved.iter_mut().zip(serialized.iter()) {
            *dst = *src as _;
        }
        let mut base: sys::CUdeviceptr = 0;
        check(
            "cuIpcOpenMemHandle",
            (sys::culib().cuIpcOpenMemHandle_v2)(
                &mut base,
                handle,
                sys::CUipcMem_flags_enum::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as u32,
            ),
        )?;
        Ok(base)
    })
}

/// 关闭先前打开的显存 IPC 句柄。
pub(crate) fn close_ipc_mem_handle(context: &PrimaryContext, base: u64) -> Result<(), WeftError> {
    context.with_current(|| unsafe {
        check(
            "cuIpcCloseMemHandle",
            (sys::culib().cuIpcCloseMemHandle)(base),
        )
    })
}

/// 设备内异步拷贝，排入给定流。
pub(crate) fn memcpy_dtod_async(
    context: &PrimaryContext,
    dst: u64,
    src: u64,
    len: usize,
    stream: CudaStream,
) -> Result<(), WeftError> {
    context.with_current(|| unsafe {
        check(
            "cuMemcpyDtoDAsync",
            (sys::culib().cuMemcpyDtoDAsync_v2)(dst, src, len, stream.raw()),
        )
    })
}
