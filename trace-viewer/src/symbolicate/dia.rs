//! DIA-backed [`LineSource`].
//!
//! The PDB reader DLL (`msdia140.dll` or equivalent) is loaded without
//! system registration: `LoadLibraryW` → `DllGetClassObject` →
//! `IClassFactory` → `IDiaDataSource`. The DIA interfaces are declared by
//! hand below: only the vtable prefix this module actually calls, in
//! dia2.h order. Trailing slots are never touched and can be omitted.
//!
//! All calls happen on the receiver thread. COM apartment setup is the
//! binary's job (`CoInitializeEx` before the session is created).

#![allow(non_snake_case)]

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use windows::core::{interface, IUnknown, IUnknown_Vtbl, Interface, BSTR, GUID, HRESULT, PCWSTR};
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::Com::IClassFactory;
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

use super::{LineRecord, LineSource, SymbolError};

/// msdia140 `DiaSource` coclass.
const CLSID_DIA_SOURCE: GUID = GUID::from_u128(0xE6756135_1E65_4D17_8576_610761398C3C);

const SYM_TAG_FUNCTION: u32 = 5;
const NS_CASE_INSENSITIVE: u32 = 0x2;

#[interface("79F1BB5F-B66E-48E5-B6A9-1545C323CA3D")]
unsafe trait IDiaDataSource: IUnknown {
    unsafe fn get_lastError(&self, ret: *mut BSTR) -> HRESULT;
    unsafe fn loadDataFromPdb(&self, pdb_path: PCWSTR) -> HRESULT;
    unsafe fn loadAndValidateDataFromPdb(
        &self,
        pdb_path: PCWSTR,
        sig70: *const GUID,
        sig: u32,
        age: u32,
    ) -> HRESULT;
    unsafe fn loadDataForExe(
        &self,
        executable: PCWSTR,
        search_path: PCWSTR,
        callback: *mut c_void,
    ) -> HRESULT;
    unsafe fn loadDataFromIStream(&self, stream: *mut c_void) -> HRESULT;
    unsafe fn openSession(&self, session: *mut Option<IDiaSession>) -> HRESULT;
}

#[interface("2F609EE1-D1C8-4E24-8288-3326BADCD211")]
unsafe trait IDiaSession: IUnknown {
    unsafe fn get_loadAddress(&self, ret: *mut u64) -> HRESULT;
    unsafe fn put_loadAddress(&self, load_address: u64) -> HRESULT;
    unsafe fn get_globalScope(&self, ret: *mut Option<IDiaSymbol>) -> HRESULT;
    unsafe fn getEnumTables(&self, ret: *mut *mut c_void) -> HRESULT;
    unsafe fn getSymbolsByAddr(&self, ret: *mut *mut c_void) -> HRESULT;
    unsafe fn findChildren(
        &self,
        parent: *mut c_void,
        symtag: u32,
        name: PCWSTR,
        compare_flags: u32,
        ret: *mut Option<IDiaEnumSymbols>,
    ) -> HRESULT;
    unsafe fn findChildrenEx(
        &self,
        parent: *mut c_void,
        symtag: u32,
        name: PCWSTR,
        compare_flags: u32,
        ret: *mut Option<IDiaEnumSymbols>,
    ) -> HRESULT;
    unsafe fn findChildrenExByAddr(
        &self,
        parent: *mut c_void,
        symtag: u32,
        name: PCWSTR,
        compare_flags: u32,
        isect: u32,
        offset: u32,
        ret: *mut Option<IDiaEnumSymbols>,
    ) -> HRESULT;
    unsafe fn findChildrenExByVA(
        &self,
        parent: *mut c_void,
        symtag: u32,
        name: PCWSTR,
        compare_flags: u32,
        va: u64,
        ret: *mut Option<IDiaEnumSymbols>,
    ) -> HRESULT;
    unsafe fn findChildrenExByRVA(
        &self,
        parent: *mut c_void,
        symtag: u32,
        name: PCWSTR,
        compare_flags: u32,
        rva: u32,
        ret: *mut Option<IDiaEnumSymbols>,
    ) -> HRESULT;
    unsafe fn findSymbolByAddr(
        &self,
        isect: u32,
        offset: u32,
        symtag: u32,
        ret: *mut Option<IDiaSymbol>,
    ) -> HRESULT;
    unsafe fn findSymbolByRVA(
        &self,
        rva: u32,
        symtag: u32,
        ret: *mut Option<IDiaSymbol>,
    ) -> HRESULT;
    unsafe fn findSymbolByVA(
        &self,
        va: u64,
        symtag: u32,
        ret: *mut Option<IDiaSymbol>,
    ) -> HRESULT;
    unsafe fn findSymbolByToken(
        &self,
        token: u32,
        symtag: u32,
        ret: *mut Option<IDiaSymbol>,
    ) -> HRESULT;
    unsafe fn symsAreEquiv(&self, sym_a: *mut c_void, sym_b: *mut c_void) -> HRESULT;
    unsafe fn symbolById(&self, id: u32, ret: *mut Option<IDiaSymbol>) -> HRESULT;
    unsafe fn findSymbolByRVAEx(
        &self,
        rva: u32,
        symtag: u32,
        ret: *mut Option<IDiaSymbol>,
        displacement: *mut i32,
    ) -> HRESULT;
    unsafe fn findSymbolByVAEx(
        &self,
        va: u64,
        symtag: u32,
        ret: *mut Option<IDiaSymbol>,
        displacement: *mut i32,
    ) -> HRESULT;
    unsafe fn findFile(
        &self,
        compiland: *mut c_void,
        name: PCWSTR,
        compare_flags: u32,
        ret: *mut Option<IDiaEnumSourceFiles>,
    ) -> HRESULT;
    unsafe fn findFileById(&self, unique_id: u32, ret: *mut Option<IDiaSourceFile>) -> HRESULT;
    unsafe fn findLines(
        &self,
        compiland: *mut c_void,
        file: *mut c_void,
        ret: *mut Option<IDiaEnumLineNumbers>,
    ) -> HRESULT;
    unsafe fn findLinesByAddr(
        &self,
        seg: u32,
        offset: u32,
        length: u32,
        ret: *mut Option<IDiaEnumLineNumbers>,
    ) -> HRESULT;
    unsafe fn findLinesByRVA(
        &self,
        rva: u32,
        length: u32,
        ret: *mut Option<IDiaEnumLineNumbers>,
    ) -> HRESULT;
}

#[interface("FE30E878-54AC-44F1-81BA-39DE940F6052")]
unsafe trait IDiaEnumLineNumbers: IUnknown {
    unsafe fn get__NewEnum(&self, ret: *mut *mut c_void) -> HRESULT;
    unsafe fn get_Count(&self, ret: *mut i32) -> HRESULT;
    unsafe fn Item(&self, index: u32, ret: *mut Option<IDiaLineNumber>) -> HRESULT;
    unsafe fn Next(
        &self,
        celt: u32,
        rgelt: *mut Option<IDiaLineNumber>,
        fetched: *mut u32,
    ) -> HRESULT;
}

#[interface("B388EB14-BE4D-421D-A8A1-6CF7AB057086")]
unsafe trait IDiaLineNumber: IUnknown {
    unsafe fn get_compiland(&self, ret: *mut Option<IDiaSymbol>) -> HRESULT;
    unsafe fn get_sourceFile(&self, ret: *mut Option<IDiaSourceFile>) -> HRESULT;
    unsafe fn get_lineNumber(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_lineNumberEnd(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_columnNumber(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_columnNumberEnd(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_addressSection(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_addressOffset(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_relativeVirtualAddress(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_virtualAddress(&self, ret: *mut u64) -> HRESULT;
    unsafe fn get_length(&self, ret: *mut u32) -> HRESULT;
}

#[interface("A2EF5353-F5A8-4EB3-90D2-CB526ACB3CDD")]
unsafe trait IDiaSourceFile: IUnknown {
    unsafe fn get_uniqueId(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_fileName(&self, ret: *mut BSTR) -> HRESULT;
    unsafe fn get_checksumType(&self, ret: *mut u32) -> HRESULT;
    unsafe fn get_compilands(&self, ret: *mut Option<IDiaEnumSymbols>) -> HRESULT;
}

#[interface("CAB72C48-443B-48F5-9B0B-42F0820AB29A")]
unsafe trait IDiaEnumSymbols: IUnknown {
    unsafe fn get__NewEnum(&self, ret: *mut *mut c_void) -> HRESULT;
    unsafe fn get_Count(&self, ret: *mut i32) -> HRESULT;
    unsafe fn Item(&self, index: u32, ret: *mut Option<IDiaSymbol>) -> HRESULT;
    unsafe fn Next(
        &self,
        celt: u32,
        rgelt: *mut Option<IDiaSymbol>,
        fetched: *mut u32,
    ) -> HRESULT;
}

#[interface("10F3DBD9-664F-4469-B808-9471C7A50538")]
unsafe trait IDiaEnumSourceFiles: IUnknown {
    unsafe fn get__NewEnum(&self, ret: *mut *mut c_void) -> HRESULT;
    unsafe fn get_Count(&self, ret: *mut i32) -> HRESULT;
    unsafe fn Item(&self, index: u32, ret: *mut Option<IDiaSourceFile>) -> HRESULT;
    unsafe fn Next(
        &self,
        celt: u32,
        rgelt: *mut Option<IDiaSourceFile>,
        fetched: *mut u32,
    ) -> HRESULT;
}

/// Passed around but never invoked; only its identity matters here.
#[interface("CB787B2F-BD6C-4635-BA52-933126BD2DCD")]
unsafe trait IDiaSymbol: IUnknown {}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn to_wide_path(path: &Path) -> Vec<u16> {
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// Keeps the reader DLL resident for the session's lifetime.
struct ReaderLibrary {
    module: HMODULE,
}

impl ReaderLibrary {
    fn load(path: &Path) -> Result<Self, SymbolError> {
        let wide = to_wide_path(path);
        let module = unsafe { LoadLibraryW(PCWSTR(wide.as_ptr())) }.map_err(|e| {
            SymbolError::LoadLibrary {
                path: path.display().to_string(),
                detail: e.message(),
            }
        })?;
        Ok(Self { module })
    }

    /// `DllGetClassObject` → class factory → data source, without any
    /// registry involvement.
    fn create_data_source(&self) -> Result<IDiaDataSource, SymbolError> {
        type DllGetClassObjectFn =
            unsafe extern "system" fn(*const GUID, *const GUID, *mut *mut c_void) -> HRESULT;

        let proc = unsafe { GetProcAddress(self.module, windows::core::s!("DllGetClassObject")) }
            .ok_or(SymbolError::MissingEntryPoint)?;
        let get_class_object: DllGetClassObjectFn = unsafe { std::mem::transmute(proc) };

        let mut factory: Option<IClassFactory> = None;
        let hr = unsafe {
            get_class_object(
                &CLSID_DIA_SOURCE,
                &IClassFactory::IID,
                std::ptr::from_mut(&mut factory).cast::<*mut c_void>(),
            )
        };
        let factory = match factory {
            Some(factory) if hr.is_ok() => factory,
            _ => return Err(SymbolError::CreateSource(format!("0x{:08X}", hr.0))),
        };

        unsafe { factory.CreateInstance::<Option<&IUnknown>, IDiaDataSource>(None) }
            .map_err(|e| SymbolError::CreateSource(e.message()))
    }
}

impl Drop for ReaderLibrary {
    fn drop(&mut self) {
        let _ = unsafe { FreeLibrary(self.module) };
    }
}

/// Live DIA session over one executable's PDB.
pub struct DiaSession {
    session: IDiaSession,
    _source: IDiaDataSource,
    // Dropped last: COM objects must be released before their code unloads.
    _library: ReaderLibrary,
}

// SAFETY: the DIA objects are apartment-agnostic and the session moves to
// the receiver thread before the first call; no other thread touches it.
unsafe impl Send for DiaSession {}

impl DiaSession {
    /// Loads the PDB associated with `exe` through the given reader DLL.
    /// `search_path` may carry a Microsoft symbol-server spec
    /// (`srv*<cache>*<url>`).
    pub fn open_for_exe(
        reader_dll: &Path,
        exe: &Path,
        search_path: Option<&str>,
    ) -> Result<Self, SymbolError> {
        let library = ReaderLibrary::load(reader_dll)?;
        let source = library.create_data_source()?;

        let exe_wide = to_wide_path(exe);
        let search_wide = search_path.map(to_wide);
        let search_ptr = search_wide
            .as_ref()
            .map_or(PCWSTR::null(), |w| PCWSTR(w.as_ptr()));
        let hr = unsafe {
            source.loadDataForExe(PCWSTR(exe_wide.as_ptr()), search_ptr, std::ptr::null_mut())
        };
        if hr.is_err() {
            return Err(SymbolError::LoadData {
                path: exe.display().to_string(),
            });
        }

        let mut session: Option<IDiaSession> = None;
        let hr = unsafe { source.openSession(&mut session) };
        match session {
            Some(session) if hr.is_ok() => {
                log::info!("debug session open for `{}`", exe.display());
                Ok(Self {
                    session,
                    _source: source,
                    _library: library,
                })
            }
            _ => Err(SymbolError::OpenSession(format!("0x{:08X}", hr.0))),
        }
    }

    fn read_line_record(&self, line: &IDiaLineNumber) -> Option<LineRecord> {
        let mut rva = 0u32;
        let mut length = 0u32;
        let mut line_number = 0u32;
        let mut column = 0u32;
        unsafe {
            line.get_relativeVirtualAddress(&mut rva).ok().ok()?;
            line.get_length(&mut length).ok().ok()?;
            line.get_lineNumber(&mut line_number).ok().ok()?;
            // Column is informational; a failed read keeps the record.
            let _ = line.get_columnNumber(&mut column);
        }
        let mut file_out: Option<IDiaSourceFile> = None;
        let file = unsafe {
            line.get_sourceFile(&mut file_out).ok().ok()?;
            let source_file = file_out?;
            let mut name = BSTR::default();
            source_file.get_fileName(&mut name).ok().ok()?;
            name.to_string()
        };
        Some(LineRecord {
            rva,
            length,
            file,
            line: line_number,
            column,
        })
    }

    fn drain_lines(&self, enumerator: &IDiaEnumLineNumbers, out: &mut Vec<LineRecord>) {
        loop {
            let mut line: Option<IDiaLineNumber> = None;
            let mut fetched = 0u32;
            let hr = unsafe { enumerator.Next(1, &mut line, &mut fetched) };
            if hr.0 != 0 || fetched == 0 {
                break;
            }
            let Some(line) = line else { break };
            if let Some(record) = self.read_line_record(&line) {
                out.push(record);
            }
        }
    }
}

impl LineSource for DiaSession {
    fn set_load_address(&self, base: u64) {
        let hr = unsafe { self.session.put_loadAddress(base) };
        if hr.is_err() {
            log::warn!("put_loadAddress({base:#x}) failed: 0x{:08X}", hr.0);
        }
    }

    fn lines_near_rva(&self, rva: u32, window: u32) -> Vec<LineRecord> {
        let mut records = Vec::new();
        let mut enumerator: Option<IDiaEnumLineNumbers> = None;
        let hr = unsafe { self.session.findLinesByRVA(rva, window, &mut enumerator) };
        if hr.is_err() {
            return records;
        }
        if let Some(enumerator) = enumerator {
            self.drain_lines(&enumerator, &mut records);
        }
        records
    }

    fn has_function_at(&self, rva: u32) -> bool {
        let mut symbol: Option<IDiaSymbol> = None;
        let hr = unsafe {
            self.session
                .findSymbolByRVA(rva, SYM_TAG_FUNCTION, &mut symbol)
        };
        hr.is_ok() && symbol.is_some()
    }

    fn lines_matching_file(&self, path_tail: &str) -> Vec<LineRecord> {
        let mut records = Vec::new();
        let tail_wide = to_wide(path_tail);
        let mut files: Option<IDiaEnumSourceFiles> = None;
        let hr = unsafe {
            self.session.findFile(
                std::ptr::null_mut(),
                PCWSTR(tail_wide.as_ptr()),
                NS_CASE_INSENSITIVE,
                &mut files,
            )
        };
        if hr.is_err() {
            return records;
        }
        let Some(files) = files else {
            return records;
        };

        loop {
            let mut file: Option<IDiaSourceFile> = None;
            let mut fetched = 0u32;
            let hr = unsafe { files.Next(1, &mut file, &mut fetched) };
            if hr.0 != 0 || fetched == 0 {
                break;
            }
            let Some(file) = file else { break };

            let mut compilands: Option<IDiaEnumSymbols> = None;
            if unsafe { file.get_compilands(&mut compilands) }.is_err() {
                continue;
            }
            let Some(compilands) = compilands else {
                continue;
            };
            loop {
                let mut compiland: Option<IDiaSymbol> = None;
                let mut fetched = 0u32;
                let hr = unsafe { compilands.Next(1, &mut compiland, &mut fetched) };
                if hr.0 != 0 || fetched == 0 {
                    break;
                }
                let Some(compiland) = compiland else { break };

                let mut lines: Option<IDiaEnumLineNumbers> = None;
                let hr = unsafe {
                    self.session
                        .findLines(compiland.as_raw(), file.as_raw(), &mut lines)
                };
                if hr.is_err() {
                    continue;
                }
                if let Some(lines) = lines {
                    self.drain_lines(&lines, &mut records);
                }
            }
        }
        records
    }
}
