//! Finds the host process and loads the payload library into it.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

const DEFAULT_SIGNATURES: &[&str] = &["minecraft", "GradleStart", "net.minecraft", "cpw.mods.modlauncher", "launchwrapper", "prismlauncher", "EntryPoint", "MultiMC"];

#[derive(Parser, Debug)]
#[command(name = "attach", version, about = "Load a frame_hook host adapter into a running host")]
struct Args {
  /// Payload library to load: the host adapter that embeds frame_hook and implements its host
  /// runtime. frame_hook itself is a plain library and ships no payload.
  #[arg(long)]
  payload: PathBuf,

  /// Skip the search and attach to this process.
  #[arg(long)]
  pid: Option<u32>,

  /// Case-insensitive substring of the target's name or command line. Repeatable.
  #[arg(long = "signature", value_name = "S")]
  signatures: Vec<String>,
}

#[derive(Clone, Debug)]
struct Process {
  pid: u32,
  name: String,
}

fn find_target<'a>(processes: &'a [Process], signatures: &[String]) -> Option<&'a Process> {
  let signatures: Vec<String> = signatures.iter().map(|s| s.to_lowercase()).collect();
  processes.iter().find(|p| {
    let name = p.name.to_lowercase();
    signatures.iter().any(|s| name.contains(s.as_str()))
  })
}

fn main() -> Result<()> {
  let args = Args::parse();

  let payload = args.payload.canonicalize().with_context(|| format!("[!] Payload not found: {}", args.payload.display()))?;

  let pid = match args.pid {
    Some(pid) => {
      println!("[*] Using manual PID: {pid}");
      pid
    }
    None => {
      let signatures = if args.signatures.is_empty() { DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect() } else { args.signatures };

      println!("[*] Searching for the host process...");
      let processes = platform::processes()?;
      match find_target(&processes, &signatures) {
        Some(target) => {
          println!("[*] Found {} (PID: {})", target.name, target.pid);
          target.pid
        }
        None => {
          println!("[!] Host process not found. Running processes:");
          for process in &processes {
            println!("    PID {}: {}", process.pid, process.name);
          }
          std::process::exit(1);
        }
      }
    }
  };

  println!("[*] Loading payload: {}", payload.display());
  platform::inject(pid, &payload)?;
  println!("[+] Injected successfully!");
  Ok(())
}

#[cfg(windows)]
mod platform {
  use super::Process;
  use anyhow::{Context, Result, bail};
  use std::{ffi::CString, path::Path, ptr};
  use winapi::{
    shared::minwindef::{FALSE, FARPROC},
    um::{
      handleapi::{CloseHandle, INVALID_HANDLE_VALUE},
      libloaderapi::{GetModuleHandleA, GetProcAddress},
      memoryapi::{VirtualAllocEx, VirtualFreeEx, WriteProcessMemory},
      minwinbase::LPTHREAD_START_ROUTINE,
      processthreadsapi::{CreateRemoteThread, GetExitCodeThread, OpenProcess},
      synchapi::WaitForSingleObject,
      tlhelp32::{CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW, TH32CS_SNAPPROCESS},
      winbase::WAIT_OBJECT_0,
      winnt::{HANDLE, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, PROCESS_ALL_ACCESS},
    },
  };

  const LOAD_TIMEOUT_MS: u32 = 10_000;

  struct Handle(HANDLE);

  impl Drop for Handle {
    fn drop(&mut self) { unsafe { CloseHandle(self.0) }; }
  }

  pub fn processes() -> Result<Vec<Process>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
      bail!("CreateToolhelp32Snapshot failed: {}", std::io::Error::last_os_error());
    }
    let snapshot = Handle(snapshot);

    let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;

    let mut processes = Vec::new();
    if unsafe { Process32FirstW(snapshot.0, &mut entry) } != 0 {
      loop {
        let len = entry.szExeFile.iter().position(|&c| c == 0).unwrap_or(entry.szExeFile.len());
        processes.push(Process { pid: entry.th32ProcessID, name: String::from_utf16_lossy(&entry.szExeFile[..len]) });
        if unsafe { Process32NextW(snapshot.0, &mut entry) } == 0 {
          break;
        }
      }
    }
    Ok(processes)
  }

  /// `LoadLibraryA` on a remote thread.
  pub fn inject(pid: u32, payload: &Path) -> Result<()> {
    let path = CString::new(payload.to_string_lossy().as_bytes()).context("payload path contains a NUL byte")?;
    let path = path.as_bytes_with_nul();

    let process = unsafe { OpenProcess(PROCESS_ALL_ACCESS, FALSE, pid) };
    if process.is_null() {
      bail!("failed to open process {pid}: {}", std::io::Error::last_os_error());
    }
    let process = Handle(process);

    let remote = unsafe { VirtualAllocEx(process.0, ptr::null_mut(), path.len(), MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    if remote.is_null() {
      bail!("VirtualAllocEx failed: {}", std::io::Error::last_os_error());
    }

    let result = (|| -> Result<()> {
      let mut written = 0;
      if unsafe { WriteProcessMemory(process.0, remote, path.as_ptr() as *const _, path.len(), &mut written) } == 0 || written != path.len() {
        bail!("WriteProcessMemory failed: {}", std::io::Error::last_os_error());
      }

      let kernel32 = unsafe { GetModuleHandleA(c"kernel32.dll".as_ptr()) };
      if kernel32.is_null() {
        bail!("kernel32 is not loaded");
      }
      let load_library: FARPROC = unsafe { GetProcAddress(kernel32, c"LoadLibraryA".as_ptr()) };
      if load_library.is_null() {
        bail!("LoadLibraryA not found");
      }
      let start: LPTHREAD_START_ROUTINE = unsafe { std::mem::transmute::<FARPROC, LPTHREAD_START_ROUTINE>(load_library) };

      let thread = unsafe { CreateRemoteThread(process.0, ptr::null_mut(), 0, start, remote, 0, ptr::null_mut()) };
      if thread.is_null() {
        bail!("CreateRemoteThread failed: {}", std::io::Error::last_os_error());
      }
      let thread = Handle(thread);

      if unsafe { WaitForSingleObject(thread.0, LOAD_TIMEOUT_MS) } != WAIT_OBJECT_0 {
        bail!("payload did not load within {LOAD_TIMEOUT_MS} ms");
      }

      let mut exit_code = 0;
      unsafe { GetExitCodeThread(thread.0, &mut exit_code) };
      if exit_code == 0 {
        bail!("LoadLibraryA returned NULL in the target");
      }
      Ok(())
    })();

    unsafe { VirtualFreeEx(process.0, remote, 0, MEM_RELEASE) };
    result
  }
}

#[cfg(not(windows))]
mod platform {
  use super::Process;
  use anyhow::{Result, bail};
  use std::{fs, path::Path};

  /// Every readable `/proc/<pid>`, named by its command line.
  pub fn processes() -> Result<Vec<Process>> {
    let mut processes = Vec::new();
    for entry in fs::read_dir("/proc")?.flatten() {
      let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else { continue };

      let cmdline = fs::read(entry.path().join("cmdline")).unwrap_or_default();
      let name = if cmdline.is_empty() {
        fs::read_to_string(entry.path().join("comm")).map(|s| s.trim().to_string()).unwrap_or_default()
      } else {
        cmdline.split(|&b| b == 0).filter(|arg| !arg.is_empty()).map(String::from_utf8_lossy).collect::<Vec<_>>().join(" ")
      };
      processes.push(Process { pid, name });
    }
    processes.sort_by_key(|p| p.pid);
    Ok(processes)
  }

  pub fn inject(pid: u32, payload: &Path) -> Result<()> { bail!("loading {} into PID {pid} is only supported on Windows", payload.display()) }
}
