//! Python bindings for ipcreg
//!
//! Function names match what the Python tensor wrapper calls.

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use ipcreg_core::{Error, IpcMemHandle, Registry};

/// Convert ipcreg error to Python exception
fn to_py_err(e: Error) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

/// (handle bytes, offset, size)
fn to_tuple(py: Python<'_>, handle: IpcMemHandle) -> (PyObject, u64, u64) {
    (
        PyBytes::new(py, &handle.handle).into_py(py),
        handle.offset,
        handle.size,
    )
}

/// Register a device pointer; False if the table is full or shm is unavailable
#[pyfunction]
fn reg_ipc_with_name(ptr: u64, size: u64, name: &str) -> PyResult<bool> {
    match Registry::global().register(ptr, size, name) {
        Ok(()) => Ok(true),
        Err(Error::TableFull) | Err(Error::SegmentUnavailable(_)) => Ok(false),
        Err(e) => Err(to_py_err(e)),
    }
}

#[pyfunction]
fn dereg_ipc_with_name(name: &str) -> bool {
    Registry::global().deregister(name).is_ok()
}

/// Returns None if the name is not registered
#[pyfunction]
fn get_ipc_by_name_once(py: Python<'_>, name: &str) -> PyResult<Option<(PyObject, u64, u64)>> {
    match Registry::global().lookup_once(name) {
        Ok(handle) => Ok(Some(to_tuple(py, handle))),
        Err(Error::NotFound) => Ok(None),
        Err(e) => Err(to_py_err(e)),
    }
}

/// Blocks until the name is registered; releases the GIL while waiting
#[pyfunction]
fn get_ipc_by_name_blocking(py: Python<'_>, name: &str) -> PyResult<(PyObject, u64, u64)> {
    let handle = py
        .allow_threads(|| Registry::global().lookup_blocking(name))
        .map_err(to_py_err)?;
    Ok(to_tuple(py, handle))
}

/// 1: shm unavailable, 2: found, 3: not found
#[pyfunction]
fn check_ipc_by_name_once(name: &str) -> i32 {
    Registry::global().check_exists(name) as i32
}

#[pymodule]
fn ipcreg(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(reg_ipc_with_name, m)?)?;
    m.add_function(wrap_pyfunction!(dereg_ipc_with_name, m)?)?;
    m.add_function(wrap_pyfunction!(get_ipc_by_name_once, m)?)?;
    m.add_function(wrap_pyfunction!(get_ipc_by_name_blocking, m)?)?;
    m.add_function(wrap_pyfunction!(check_ipc_by_name_once, m)?)?;
    m.add("CAPACITY", ipcreg_core::CAPACITY)?;
    m.add("NAME_MAX_LEN", ipcreg_core::NAME_MAX_LEN)?;
    Ok(())
}
