//! Resource protection: computing the UNLOCK key for a GET_SEED seed.
use std::path::Path;

use anyhow::Result;
use libloading::{Library, Symbol};

/// Upper bound for seeds and keys, both are announced in a single length byte.
const MAX_KEY_LEN: usize = 255;

/// Seed/key algorithm for unlocking protected resources of the slave.
pub trait SeedKey {
    /// Bit mask of the resources this algorithm can unlock.
    fn available_privileges(&self) -> Result<u8>;

    /// Compute the key that unlocks `resource` for the given seed.
    fn compute_key(&self, resource: u8, seed: &[u8]) -> Result<Vec<u8>>;
}

type ComputeKeyFn = unsafe extern "C" fn(u8, u8, *const u8, *mut u8, *mut u8) -> u32;
type GetPrivilegesFn = unsafe extern "C" fn(*mut u8) -> u32;

/// Seed/key algorithm exported by a shared library as `XCP_ComputeKeyFromSeed` and
/// `XCP_GetAvailablePrivileges`. Both return 0 on success.
pub struct SeedKeyLibrary {
    library: Library,
}

impl SeedKeyLibrary {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading seed/key library {}", path.display());
        // SAFETY: loading runs the library's initializers, the library is trusted by the user.
        let library = unsafe { Library::new(path)? };
        let this = SeedKeyLibrary { library };
        // Fail early on a library without the expected exports.
        this.compute_key_fn()?;
        this.privileges_fn()?;
        Ok(this)
    }

    fn compute_key_fn(&self) -> Result<Symbol<'_, ComputeKeyFn>> {
        // SAFETY: the signature matches the exported C prototype.
        Ok(unsafe { self.library.get(b"XCP_ComputeKeyFromSeed\0")? })
    }

    fn privileges_fn(&self) -> Result<Symbol<'_, GetPrivilegesFn>> {
        // SAFETY: the signature matches the exported C prototype.
        Ok(unsafe { self.library.get(b"XCP_GetAvailablePrivileges\0")? })
    }
}

impl SeedKey for SeedKeyLibrary {
    fn available_privileges(&self) -> Result<u8> {
        let get_privileges = self.privileges_fn()?;
        let mut resource = 0u8;
        // SAFETY: `resource` outlives the call.
        let ret = unsafe { get_privileges(&mut resource) };
        anyhow::ensure!(ret == 0, "XCP_GetAvailablePrivileges failed with {}", ret);
        Ok(resource)
    }

    fn compute_key(&self, resource: u8, seed: &[u8]) -> Result<Vec<u8>> {
        anyhow::ensure!(seed.len() <= MAX_KEY_LEN, "seed too long");
        let compute_key = self.compute_key_fn()?;
        let mut key = vec![0u8; MAX_KEY_LEN];
        let mut key_len = 0u8;
        // SAFETY: the key buffer holds the largest key a length byte can announce.
        let ret = unsafe {
            compute_key(
                resource,
                seed.len() as u8,
                seed.as_ptr(),
                &mut key_len,
                key.as_mut_ptr(),
            )
        };
        anyhow::ensure!(ret == 0, "XCP_ComputeKeyFromSeed failed with {}", ret);
        key.truncate(key_len as usize);
        Ok(key)
    }
}
