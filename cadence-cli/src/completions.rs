//! Shell completion scripts
//!
//! The generated bash and zsh scripts know every subcommand and flag of
//! `cadence`. Keys for `--set` are not baked in: the scripts call the hidden
//! `complete-paths` subcommand, which lists the dotted paths of the
//! [`ProfileConfig`] JSON schema.

use schemars::schema::{Schema, SchemaObject, SingleOrVec};
use schemars::schema_for;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ProfileConfig;

const SUBCOMMANDS: &str = "serve send check-delay check-isoch completions schema help";
const STRATEGIES: &str = "auto busy-loop sleep hybrid kalman";
const LOG_LEVELS: &str = "trace debug info warn error";

/// Bash completion script for `bin_name`
///
/// Install by writing it to `~/.local/share/bash-completion/completions/cadence`.
pub fn generate_bash_completion(bin_name: &str) -> String {
    format!(
        r#"# bash completion for {bin_name}

_{bin_name}() {{
    local cur prev words cword
    _init_completion || return

    if [[ "$prev" == "--set" ]]; then
        [[ "$cur" == *"="* ]] && return 0
        local keys
        keys=$({bin_name} complete-paths 2>/dev/null)
        COMPREPLY=( $(compgen -W "$keys" -S "=" -- "$cur") )
        compopt -o nospace
        return 0
    fi

    case "$prev" in
        -P|--profile) _filedir toml; return 0 ;;
        -l|--log-level) COMPREPLY=( $(compgen -W "{LOG_LEVELS}" -- "$cur") ); return 0 ;;
        -s|--strategy) COMPREPLY=( $(compgen -W "{STRATEGIES}" -- "$cur") ); return 0 ;;
    esac

    if [[ $cword -eq 1 ]]; then
        COMPREPLY=( $(compgen -W "{SUBCOMMANDS}" -- "$cur") )
        return 0
    fi

    local flags="-l --log-level -h --help"
    case "${{words[1]}}" in
        serve|send) flags+=" -P --profile --set" ;;
        check-delay) flags+=" -d --delay -i --iterations -a --affinity -r --realtime -c --clock -s --strategy" ;;
        check-isoch) flags+=" -c --count -f --fps -s --strategy" ;;
        completions)
            [[ "$cur" != -* ]] && COMPREPLY=( $(compgen -W "bash zsh fish" -- "$cur") ) && return 0
            ;;
    esac
    [[ "$cur" == -* ]] && COMPREPLY=( $(compgen -W "$flags" -- "$cur") )
    return 0
}}

complete -F _{bin_name} {bin_name}
"#
    )
}

/// Zsh completion script for `bin_name`
///
/// Install by writing it as `_cadence` into a directory on `$fpath`.
pub fn generate_zsh_completion(bin_name: &str) -> String {
    format!(
        r#"#compdef {bin_name}

_{bin_name}_set_keys() {{
    local -a keys
    keys=(${{(f)"$({bin_name} complete-paths 2>/dev/null)"}})
    _describe 'profile key' keys -S '='
}}

_{bin_name}() {{
    local line state
    local strategy='(-s --strategy)'{{-s,--strategy}}'[Delay strategy]:strategy:({STRATEGIES})'

    _arguments -C \
        '(-l --log-level)'{{-l,--log-level}}'[Log level]:level:({LOG_LEVELS})' \
        '1: :->command' \
        '*:: :->args'

    case $state in
        command)
            local -a commands
            commands=(
                'serve:Receive flows and report their statistics'
                'send:Send a paced UDP or TCP flow'
                'check-delay:Measure how long the delay engine really blocks'
                'check-isoch:Tick a frame counter and show slip detection'
                'completions:Generate shell completions'
                'schema:Generate JSON Schema for profile files'
            )
            _describe 'command' commands
            ;;
        args)
            case $line[1] in
                serve|send)
                    _arguments \
                        '(-P --profile)'{{-P,--profile}}'[Profile]:file:_files -g "*.toml"' \
                        '*--set[Override a profile value]:key=value:_{bin_name}_set_keys'
                    ;;
                check-delay)
                    _arguments $strategy \
                        '(-d --delay)'{{-d,--delay}}'[Requested delay in usec]:usec:' \
                        '(-i --iterations)'{{-i,--iterations}}'[Delays to measure]:count:' \
                        '(-a --affinity)'{{-a,--affinity}}'[Pin to core]:core:' \
                        '(-r --realtime)'{{-r,--realtime}}'[SCHED_RR with locked memory]' \
                        '(-c --clock)'{{-c,--clock}}'[Time a clock read instead]'
                    ;;
                check-isoch)
                    _arguments $strategy \
                        '(-c --count)'{{-c,--count}}'[Ticks]:count:' \
                        '(-f --fps)'{{-f,--fps}}'[Frames per second]:fps:'
                    ;;
                completions)
                    _arguments '1:shell:(bash zsh fish)'
                    ;;
            esac
            ;;
    esac
}}

_{bin_name} "$@"
"#
    )
}

/// Every dotted key accepted by `--set`, sorted
pub fn get_config_paths() -> Vec<String> {
    let root = schema_for!(ProfileConfig);
    let mut walker = PathWalker { definitions: &root.definitions, paths: BTreeSet::new() };
    walker.visit_object(&root.schema, "");
    walker.paths.into_iter().collect()
}

struct PathWalker<'a> {
    definitions: &'a BTreeMap<String, Schema>,
    paths: BTreeSet<String>,
}

impl PathWalker<'_> {
    fn visit(&mut self, schema: &Schema, prefix: &str) {
        let Schema::Object(obj) = schema else {
            return;
        };
        match obj.reference.as_deref().and_then(|r| r.strip_prefix("#/definitions/")) {
            Some(name) => {
                if let Some(target) = self.definitions.get(name) {
                    self.visit(target, prefix);
                }
            }
            None => self.visit_object(obj, prefix),
        }
    }

    fn visit_object(&mut self, obj: &SchemaObject, prefix: &str) {
        if let Some(object) = &obj.object {
            for (name, property) in &object.properties {
                let path =
                    if prefix.is_empty() { name.clone() } else { format!("{prefix}.{name}") };
                self.paths.insert(path.clone());
                self.visit(property, &path);
            }
        }

        // Enum variants, Option<T> sections (anyOf [T, null]) and flattened structs
        if let Some(sub) = &obj.subschemas {
            let variants = [&sub.one_of, &sub.any_of, &sub.all_of];
            for schema in variants.into_iter().flatten().flatten() {
                self.visit(schema, prefix);
            }
        }

        let items = obj.array.as_ref().and_then(|a| a.items.as_ref());
        if let Some(SingleOrVec::Single(item)) = items {
            let path = format!("{prefix}.0");
            self.paths.insert(path.clone());
            self.visit(item, &path);
        }
    }
}
