use abi::Abi;
use log::debug;
use runtime::{AccessFlags, Classpath, Machine, Processor, Ref};

use crate::error::Result;
use crate::typemap::{class_maps, pool_type_map, TypeMaps};

/// Optional class/method/spec filters from the command line. Absent filters
/// match everything.
#[derive(Debug, Default, Clone)]
pub struct Filters {
    pub class_name: Option<String>,
    pub method_name: Option<String>,
    pub method_spec: Option<String>,
}

impl Filters {
    fn class_matches(&self, name: &str) -> bool {
        self.class_name.as_deref().is_none_or(|f| f == name)
    }

    fn method_matches(&self, m: &Machine, method: Ref) -> bool {
        let name_ok = self
            .method_name
            .as_deref()
            .is_none_or(|f| m.byte_array_as_str(m.method_name(method)) == f);
        let spec_ok = self
            .method_spec
            .as_deref()
            .is_none_or(|f| m.byte_array_as_str(m.method_spec(method)) == f);
        name_ok && spec_ok
    }
}

/// Scan the classpath: resolve every matching class, install its pool and
/// field-table type maps, and compile every matching method that has code or
/// is native.
pub fn scan_classes(
    m: &mut Machine,
    processor: &mut Processor,
    maps: &mut TypeMaps,
    classpath: &Classpath,
    filters: &Filters,
    target: Abi,
) -> Result<()> {
    let build = m.build_abi();

    for (entry_name, bytes) in classpath.iter() {
        if !entry_name.ends_with(".class") {
            continue;
        }
        let class_name = &entry_name[..entry_name.len() - ".class".len()];
        if !filters.class_matches(class_name) {
            continue;
        }
        debug!("scanning {class_name}");

        let class = m.resolve_system_class(class_name, bytes)?;

        if let Some(map) = pool_type_map(bytes, build, target)? {
            let pool = *m
                .pool_map
                .get(&class)
                .unwrap_or_else(|| panic!("{class_name} has no runtime pool"));
            maps.insert(pool, map);
        }

        if !m.class_field_table(class).is_null() {
            let (member_map, static_map) = class_maps(m, class, build, target);
            maps.insert(class, member_map);
            if let Some((static_table, map)) = static_map {
                maps.insert(static_table, map);
            }
        }

        let method_table = m.class_method_table(class);
        if !method_table.is_null() {
            for i in 0..m.array_length(method_table) {
                let method = m.array_element(method_table, i);
                if !filters.method_matches(m, method) {
                    continue;
                }
                let flags = m.method_flags(method);
                if !m.method_code(method).is_null()
                    || flags.contains(AccessFlags::NATIVE)
                {
                    processor.compile_method(m, method);
                }
            }
        }
    }
    Ok(())
}
